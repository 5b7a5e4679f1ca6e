//! Wire protocol for the transcription backend channel
//!
//! This module defines the JSON message types exchanged with the backend
//! over the WebSocket. Every frame is a tagged object:
//!
//! ```text
//! { "type": "<event name>", "payload": { ... } }
//! ```
//!
//! # Protocol Overview
//!
//! 1. Connect to `ws://<host>/ws`
//! 2. Stream microphone audio via `audio_stream` (base64 PCM16 payload)
//! 3. Signal end of a live stream via `audio_stream_end`
//! 4. Deliver whole files via `fileUpload` (id + name + base64 data)
//! 5. Receive `transcript` / `summary` / `participants` / `fileStatus`

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::upload::FileState;

/// A transcript segment produced by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,

    /// Speaker attribution as reported by the backend.
    #[serde(default)]
    pub participant: String,

    pub content: String,

    /// Backend-formatted timestamp, passed through untouched.
    #[serde(default)]
    pub timestamp: String,
}

/// A meeting summary produced by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
}

/// A meeting participant as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(rename = "isActive", default)]
    pub is_active: bool,
}

// ============================================================================
// Client Events (sent TO the backend)
// ============================================================================

/// Messages sent from the client to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    /// One chunk of live microphone audio (base64-encoded PCM16 LE).
    #[serde(rename = "audio_stream")]
    AudioStream { audio: String },

    /// End of the current live stream; no payload.
    #[serde(rename = "audio_stream_end")]
    AudioStreamEnd,

    /// A complete uploaded file (base64-encoded bytes).
    #[serde(rename = "fileUpload")]
    FileUpload { id: Uuid, name: String, data: String },
}

impl ClientEvent {
    /// Build an `audio_stream` event from raw PCM16 samples.
    pub fn audio_stream(samples: &[i16]) -> Self {
        // Little-endian byte order, matching what the backend decodes
        let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();

        Self::AudioStream {
            audio: STANDARD.encode(&bytes),
        }
    }

    /// Build the end-of-stream marker.
    pub fn audio_stream_end() -> Self {
        Self::AudioStreamEnd
    }

    /// Build a `fileUpload` event carrying the whole file.
    pub fn file_upload(id: Uuid, name: &str, data: &[u8]) -> Self {
        Self::FileUpload {
            id,
            name: name.to_string(),
            data: STANDARD.encode(data),
        }
    }
}

// ============================================================================
// Server Events (received FROM the backend)
// ============================================================================

/// Messages received from the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    /// A transcript segment for the live stream or an uploaded file.
    #[serde(rename = "transcript")]
    Transcript(Transcript),

    /// A meeting summary.
    #[serde(rename = "summary")]
    Summary(Summary),

    /// Current participant roster.
    #[serde(rename = "participants")]
    Participants(Vec<Participant>),

    /// Processing-status update for an uploaded file.
    #[serde(rename = "fileStatus")]
    FileStatus {
        id: Uuid,
        status: FileState,
        #[serde(default)]
        duration: Option<f64>,
    },

    /// Backend acknowledged the session.
    #[serde(rename = "connected")]
    Connected,

    /// Backend announced it is going away.
    #[serde(rename = "disconnected")]
    Disconnected,

    /// Backend-reported error.
    #[serde(rename = "error")]
    Error { message: String },

    /// Catch-all for message types we don't handle.
    /// This prevents deserialization failures for unknown types.
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Check if this is an error message
    pub fn is_error(&self) -> bool {
        matches!(self, ServerEvent::Error { .. })
    }

    /// Extract the error message if this is an error event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ServerEvent::Error { message } => Some(message),
            _ => None,
        }
    }
}
