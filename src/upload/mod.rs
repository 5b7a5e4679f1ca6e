//! File-upload-as-message pipeline
//!
//! Reads a whole file into memory, tags it with a fresh id, delivers it as a
//! single `fileUpload` message over the shared backend channel, and tracks
//! per-file status locally until the backend reports a terminal state.
//!
//! Chunked upload, progress reporting, and resumability are deliberate
//! extension points, not silent assumptions: a file larger than available
//! memory is out of contract for this encoder.

mod encoder;

pub use encoder::{UploadManager, UploadedFile};

use serde::{Deserialize, Serialize};

use crate::streaming::TransportError;

/// Processing status of an uploaded file.
///
/// Status only ever moves forward: `processing` reaches exactly one of the
/// terminal states and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Processing,
    Completed,
    Error,
}

impl FileState {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Completed | FileState::Error)
    }
}

/// Errors that can occur while uploading a file.
#[derive(Debug)]
pub enum UploadError {
    /// The file could not be read into memory
    ReadError(String),
    /// The channel refused the upload message
    Transport(TransportError),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::ReadError(e) => write!(f, "Failed to read file: {}", e),
            UploadError::Transport(e) => write!(f, "Failed to deliver file: {}", e),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        UploadError::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!FileState::Processing.is_terminal());
        assert!(FileState::Completed.is_terminal());
        assert!(FileState::Error.is_terminal());
    }

    #[test]
    fn file_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&FileState::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::from_str::<FileState>("\"completed\"").unwrap(),
            FileState::Completed
        );
    }

    #[test]
    fn upload_error_display() {
        let err = UploadError::ReadError("no such file".to_string());
        assert!(err.to_string().contains("no such file"));

        let err = UploadError::Transport(TransportError::NotConnected);
        assert!(err.to_string().contains("not connected"));
    }
}
