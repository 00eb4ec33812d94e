use thiserror::Error;

use talkback_core::error::TalkError;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network, auth, or upstream protocol failure.
    #[error("{0}")]
    Unavailable(String),

    /// Empty audio, text, or prompt; rejected before any network call.
    #[error("{0}")]
    InvalidInput(String),
}

impl ProviderError {
    pub fn unavailable(msg: impl std::fmt::Display) -> Self {
        Self::Unavailable(msg.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unavailable(format!("HTTP error: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProviderError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Unavailable(format!("WebSocket error: {e}"))
    }
}

impl From<ProviderError> for TalkError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unavailable(msg) => TalkError::ProviderUnavailable(msg),
            ProviderError::InvalidInput(msg) => TalkError::InvalidInput(msg),
        }
    }
}

/// Turn a non-success HTTP response into `Unavailable`, keeping the body for logs.
pub(crate) async fn check_status(
    resp: reqwest::Response,
    api: &str,
) -> Result<reqwest::Response, ProviderError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Unavailable(format!("{api} API error {status}: {body}")))
}
