//! Streaming transport to the transcription backend
//!
//! This module owns the persistent WebSocket channel shared by the live
//! microphone path and the file-upload path, plus the chunk pipeline that
//! feeds it.
//!
//! # Architecture
//!
//! ```text
//! Audio Thread (sync)             Tokio Runtime (async)
//! ┌─────────────────┐             ┌───────────────────────┐
//! │ CPAL Callback   │──channel──▶ │ ChunkStreamer::run()  │
//! │ try_send(batch) │             │   ├─ downsample       │
//! └─────────────────┘             │   ├─ cut 250ms chunks │
//!                                 │   └─ ChannelHandle    │
//!                                 └──────────┬────────────┘
//!                                            ▼
//!                                  Channel supervisor task
//!                                  (WebSocket + reconnect)
//! ```
//!
//! # Delivery semantics
//!
//! `send` fails fast with [`TransportError::NotConnected`] while the link is
//! down; nothing is queued for replay. Payloads the writer accepted but could
//! not put on the wire are reported through [`ChannelEvent::DeliveryGap`], so
//! no loss is ever silent. After the bounded reconnection attempts are
//! exhausted the channel is terminally failed and every send fails fast.

mod channel;
mod protocol;
mod streamer;

pub use channel::{Channel, ChannelConfig, ChannelEvent, ChannelHandle, LinkState};
pub use protocol::{ClientEvent, Participant, ServerEvent, Summary, Transcript};
pub use streamer::{ChunkStreamer, StreamStats, StreamerConfig};

/// Errors that can occur on the transport channel
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The link is down (or terminally failed); the payload was not accepted
    NotConnected,
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// Malformed frame or serialization failure
    ProtocolError(String),
    /// The payload was accepted but could not be written
    SendFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected => {
                write!(f, "not connected to the transcription backend")
            }
            TransportError::ConnectionFailed(e) => {
                write!(f, "failed to connect to the transcription backend: {}", e)
            }
            TransportError::ProtocolError(e) => {
                write!(f, "channel protocol error: {}", e)
            }
            TransportError::SendFailed(e) => {
                write!(f, "failed to send payload: {}", e)
            }
        }
    }
}

impl std::error::Error for TransportError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        let err = TransportError::NotConnected;
        assert!(err.to_string().contains("not connected"));

        let err = TransportError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = TransportError::SendFailed("queue full".to_string());
        assert!(err.to_string().contains("queue full"));
    }
}
