//! Scheduler error types.

use thiserror::Error;

use minicloud_backend::BackendError;
use minicloud_state::{ClusterError, ErrorKind};

/// Errors that can occur while scheduling, provisioning or running jobs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("execution backend unavailable: {0}")]
    Backend(#[from] BackendError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid job id {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidJobId(String),

    #[error("invalid node name {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidNodeName(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Cluster(e) => e.kind(),
            SchedulerError::Backend(_) | SchedulerError::Io(_) => ErrorKind::BackendUnavailable,
            SchedulerError::InvalidJobId(_) | SchedulerError::InvalidNodeName(_) => {
                ErrorKind::Validation
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::Cluster(e) if e.is_not_found())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Whether `s` is safe to use as a single path component and inside a
/// quoted shell word.
pub(crate) fn is_safe_ident(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && !s.starts_with('.')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
