use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::streaming::{ChannelConfig, StreamerConfig};

const SETTINGS_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "meetscribe";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// WebSocket endpoint of the transcription backend.
    pub server_url: String,

    /// Base URL of the backend's HTTP API (model catalog).
    pub api_base_url: String,

    /// Bound on connection attempts, both the initial connect and a
    /// mid-session reconnect.
    pub reconnect_attempts: u32,

    /// Cadence of live audio chunks in milliseconds.
    pub chunk_duration_ms: u32,

    /// Sample rate the backend expects for microphone audio.
    pub target_sample_rate: u32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:5000/ws".to_string(),
            api_base_url: "http://localhost:5000/api".to_string(),
            reconnect_attempts: 3,
            chunk_duration_ms: 250,
            target_sample_rate: 16_000,
        }
    }
}

impl AppSettings {
    /// Channel configuration derived from these settings.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            endpoint: self.server_url.clone(),
            reconnect_attempts: self.reconnect_attempts,
            ..ChannelConfig::default()
        }
    }

    /// Chunk-pipeline configuration derived from these settings.
    ///
    /// The source sample rate is a placeholder; the effect runner replaces
    /// it with whatever the capture device actually delivers.
    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            target_sample_rate: self.target_sample_rate,
            chunk_duration_ms: self.chunk_duration_ms,
            ..StreamerConfig::default()
        }
    }

    /// Apply environment overrides (useful behind proxies and in dev).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("MEETSCRIBE_SERVER_URL") {
            if !url.is_empty() {
                self.server_url = url;
            }
        }
        if let Ok(url) = std::env::var("MEETSCRIBE_API_URL") {
            if !url.is_empty() {
                self.api_base_url = url;
            }
        }
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Settings: {}", e);
            return AppSettings::default();
        }
    };
    load_from(&path)
}

pub fn load_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    let path = settings_path()?;
    save_to(&path, settings)
}

pub fn save_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then rename.
    // This prevents partial/corrupt settings.json if the process dies mid-write.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Unix, rename will atomically replace the destination. On Windows, rename
    // fails if the destination exists, so we remove it first (ignoring NotFound).
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
