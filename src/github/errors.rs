//! Error types for the fetch layer.

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("response body is not a JSON array: {0}")]
    Body(#[from] serde_json::Error),
}
