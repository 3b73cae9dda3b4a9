//! Crate-wide error type.
//!
//! Per-upload failures have their own taxonomy in [`crate::upload`]; this
//! enum covers configuration, job lifecycle and collaborator failures.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A job could not run at all.
    #[error("Job rejected: {0}")]
    Validation(String),

    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: String, id: String },

    #[error("Job cannot move from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error("Notification failed: {0}")]
    Notification(String),

    /// Client construction only. Request errors are mapped elsewhere so that
    /// credential-bearing URLs never reach a message.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn notification(msg: impl Into<String>) -> Self {
        Self::Notification(msg.into())
    }
}
