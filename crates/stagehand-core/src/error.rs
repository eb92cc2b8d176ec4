//! Error types for stagehand.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A dependency exists but is not usable yet.
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timed out after {waited:?} waiting for {what} (last observed: {last})")]
    Timeout {
        what: String,
        waited: Duration,
        last: String,
    },

    #[error("remote API error: {0}")]
    Remote(String),

    #[error("{what} reached status {status}")]
    UnexpectedStatus { what: String, status: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
