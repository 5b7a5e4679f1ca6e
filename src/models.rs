//! Model catalog client
//!
//! Thin HTTP client for the backend's model API: list the available
//! transcription models and select the active one. Both calls are
//! single-shot; a failure surfaces to the caller instead of being retried.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Errors from the model catalog API
#[derive(Debug)]
pub enum CatalogError {
    /// Network/HTTP error
    NetworkError(String),
    /// The backend returned an error status
    ApiError { status: u16, message: String },
    /// Failed to parse the response
    ParseError(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::NetworkError(e) => write!(f, "Network error: {}", e),
            CatalogError::ApiError { status, message } => {
                write!(f, "Model API error ({}): {}", status, message)
            }
            CatalogError::ParseError(e) => write!(f, "Failed to parse model API response: {}", e),
        }
    }
}

impl std::error::Error for CatalogError {}

/// Description of one transcription model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub speed: String,
    #[serde(default)]
    pub english_only: bool,
}

/// The catalog as served by `GET /api/models`
#[derive(Debug, Clone, Deserialize)]
pub struct ModelCatalog {
    pub models: HashMap<String, ModelInfo>,
    pub current_model: String,
}

impl ModelCatalog {
    /// Models sorted by key for stable presentation.
    pub fn models_sorted(&self) -> Vec<(&String, &ModelInfo)> {
        let mut entries: Vec<_> = self.models.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

/// Fetch the model catalog.
pub async fn fetch_models(base_url: &str) -> Result<ModelCatalog, CatalogError> {
    let url = format!("{}/models", base_url.trim_end_matches('/'));

    let response = http_client()
        .get(&url)
        .send()
        .await
        .map_err(|e| CatalogError::NetworkError(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CatalogError::ApiError {
            status: status.as_u16(),
            message: body,
        });
    }

    response
        .json::<ModelCatalog>()
        .await
        .map_err(|e| CatalogError::ParseError(e.to_string()))
}

#[derive(Serialize)]
struct SelectModelRequest<'a> {
    model: &'a str,
}

#[derive(Deserialize)]
struct SelectModelResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Select the active transcription model.
pub async fn select_model(base_url: &str, model_key: &str) -> Result<(), CatalogError> {
    let url = format!("{}/models/select", base_url.trim_end_matches('/'));

    let response = http_client()
        .post(&url)
        .json(&SelectModelRequest { model: model_key })
        .send()
        .await
        .map_err(|e| CatalogError::NetworkError(e.to_string()))?;

    let status = response.status();
    let body = response
        .json::<SelectModelResponse>()
        .await
        .map_err(|e| CatalogError::ParseError(e.to_string()))?;

    if !status.is_success() || !body.success {
        return Err(CatalogError::ApiError {
            status: status.as_u16(),
            message: body
                .error
                .unwrap_or_else(|| "model selection rejected".to_string()),
        });
    }

    Ok(())
}
