use thiserror::Error;

use crate::ledger::LedgerError;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Unrecoverable initialization failure; the run stops before any work starts.
    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("GitHub API error: {message}")]
    Api { message: String },
}

pub type Result<T> = std::result::Result<T, NotifyError>;
