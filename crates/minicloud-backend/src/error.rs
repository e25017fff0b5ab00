//! Error types for execution backends.

use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("no stats reported for container {0}")]
    NoStats(String),

    #[error("backend rejected {op}: {reason}")]
    Rejected { op: &'static str, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
