//! Upload encoder and per-file status registry

use std::collections::HashMap;
use std::path::Path;

use uuid::Uuid;

use super::{FileState, UploadError};
use crate::streaming::{ChannelHandle, ClientEvent};

/// Locally tracked record of an uploaded file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadedFile {
    pub id: Uuid,
    pub name: String,
    /// Duration in seconds; 0 until known (WAV probe or backend report)
    pub duration: f64,
    pub status: FileState,
}

/// Owns the upload path over the shared backend channel.
///
/// Records are created in `processing` when a file is selected, transition
/// forward as `fileStatus` events arrive, and are destroyed only by
/// [`UploadManager::remove`].
pub struct UploadManager {
    channel: ChannelHandle,
    files: HashMap<Uuid, UploadedFile>,
}

impl UploadManager {
    pub fn new(channel: ChannelHandle) -> Self {
        Self {
            channel,
            files: HashMap::new(),
        }
    }

    /// Read a file fully into memory and deliver it as one `fileUpload`
    /// message.
    ///
    /// The record exists (in `processing`) before the read starts; a read
    /// failure transitions it to `error` and nothing is sent. The returned
    /// id is the same id carried by the wire message.
    pub async fn upload(&mut self, path: &Path) -> Result<Uuid, UploadError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let id = Uuid::new_v4();
        self.files.insert(
            id,
            UploadedFile {
                id,
                name: name.clone(),
                duration: 0.0,
                status: FileState::Processing,
            },
        );

        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                log::error!("Upload {}: failed to read {:?}: {}", id, path, e);
                self.set_status(id, FileState::Error);
                return Err(UploadError::ReadError(e.to_string()));
            }
        };

        // A WAV header is cheap to probe locally; anything else stays at 0
        // until the backend reports a duration
        if let Some(duration) = probe_wav_duration(&data) {
            if let Some(file) = self.files.get_mut(&id) {
                file.duration = duration;
            }
        }

        log::info!("Upload {}: sending {} ({} bytes)", id, name, data.len());

        if let Err(e) = self.channel.send(ClientEvent::file_upload(id, &name, &data)) {
            log::error!("Upload {}: delivery failed: {}", id, e);
            self.set_status(id, FileState::Error);
            return Err(e.into());
        }

        Ok(id)
    }

    /// Remove the local record. Idempotent; does not cancel an in-flight
    /// transfer.
    pub fn remove(&mut self, id: Uuid) -> bool {
        self.files.remove(&id).is_some()
    }

    /// Apply a backend `fileStatus` report.
    ///
    /// Transitions are forward-only: once a record is terminal, further
    /// reports are ignored, so exactly one terminal state is reached.
    /// Returns whether the record actually changed state.
    pub fn apply_status(&mut self, id: Uuid, status: FileState, duration: Option<f64>) -> bool {
        let Some(file) = self.files.get_mut(&id) else {
            log::debug!("fileStatus for unknown upload {}", id);
            return false;
        };

        if file.status.is_terminal() {
            if file.status != status {
                log::warn!(
                    "Ignoring fileStatus {:?} for {} already in terminal {:?}",
                    status,
                    id,
                    file.status
                );
            }
            return false;
        }

        if let Some(duration) = duration {
            file.duration = duration;
        }

        if file.status != status {
            log::info!("Upload {}: {:?} -> {:?}", id, file.status, status);
            file.status = status;
            return true;
        }

        false
    }

    pub fn get(&self, id: Uuid) -> Option<&UploadedFile> {
        self.files.get(&id)
    }

    /// Snapshot of all records, sorted by name for stable presentation.
    pub fn files(&self) -> Vec<UploadedFile> {
        let mut files: Vec<UploadedFile> = self.files.values().cloned().collect();
        files.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        files
    }

    /// Whether every known record has reached a terminal state.
    pub fn all_settled(&self) -> bool {
        self.files.values().all(|f| f.status.is_terminal())
    }

    fn set_status(&mut self, id: Uuid, status: FileState) {
        if let Some(file) = self.files.get_mut(&id) {
            file.status = status;
        }
    }
}

/// Probe the duration of an in-memory WAV file, if it is one.
fn probe_wav_duration(data: &[u8]) -> Option<f64> {
    let reader = hound::WavReader::new(std::io::Cursor::new(data)).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(reader.duration() as f64 / spec.sample_rate as f64)
}
