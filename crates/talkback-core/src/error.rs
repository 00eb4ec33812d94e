use thiserror::Error;

#[derive(Debug, Error)]
pub enum TalkError {
    #[error("Session not found or expired")]
    SessionNotFound,

    #[error("Scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TalkError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "session_not_found",
            Self::ScenarioNotFound(_) => "scenario_not_found",
            Self::UserNotFound(_) => "user_not_found",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::InvalidInput(_) => "invalid_input",
            Self::Store(_) => "store_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, TalkError>;
