//! Error types for the liftlog_core library.

use std::io;
use uuid::Uuid;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for liftlog_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An event was dispatched that is not legal from the current state.
    /// The session is left unchanged.
    #[error("invalid transition: {event} is not legal from {from}")]
    InvalidTransition { from: String, event: String },

    /// No session with this id is known to the orchestrator
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    /// Session-level validation error (bad event payload, terminal session, ...)
    #[error("session error: {0}")]
    Session(String),

    /// A local durable write failed after retrying
    #[error("persistence error: {0}")]
    Persistence(String),
}
