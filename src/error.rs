//! Error types for audit-worker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed notification: {0}")]
    MalformedNotification(String),

    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("audit failed: {0}")]
    Audit(String),

    #[error("artifact upload failed for {key}: {reason}")]
    Artifact { key: String, reason: String },

    #[error("injected fault before audit run")]
    InjectedFault,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
