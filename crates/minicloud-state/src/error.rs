//! Error types for the minicloud registry.

use thiserror::Error;

use crate::types::NodeType;

/// Result type alias for registry operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Broad classification used by callers to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing caller input.
    Validation,
    /// The cluster is not in a state that permits the operation.
    StateConflict,
    /// The execution backend could not complete a call.
    BackendUnavailable,
    /// The registry disagrees with itself or with an inbound report.
    ConsistencyViolation,
}

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster is not initialized")]
    NotInitialized,

    #[error("pod not found: {0}")]
    PodNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("duplicate job id: {0}")]
    DuplicateJobId(String),

    #[error("invalid node range: {0}")]
    InvalidRange(String),

    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("node {node_id} is not a {expected:?} node")]
    WrongNodeKind { node_id: String, expected: NodeType },

    #[error("pod {0} still owns nodes")]
    NotEmpty(String),

    #[error("node {0} is busy")]
    NodeBusy(String),

    #[error("no available nodes")]
    NoAvailableNodes,

    #[error("pod {0} is elastic and only holds server nodes")]
    ElasticPod(String),

    #[error("port range exhausted")]
    PortsExhausted,

    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("no randomness available: {0}")]
    Entropy(String),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::PodNotFound(_)
            | ClusterError::NodeNotFound(_)
            | ClusterError::JobNotFound(_)
            | ClusterError::DuplicateName(_)
            | ClusterError::DuplicateJobId(_)
            | ClusterError::InvalidRange(_)
            | ClusterError::InvalidThreshold(_)
            | ClusterError::WrongNodeKind { .. } => ErrorKind::Validation,
            ClusterError::NotInitialized
            | ClusterError::NotEmpty(_)
            | ClusterError::NodeBusy(_)
            | ClusterError::NoAvailableNodes
            | ClusterError::ElasticPod(_)
            | ClusterError::PortsExhausted => ErrorKind::StateConflict,
            ClusterError::ConsistencyViolation(_) => ErrorKind::ConsistencyViolation,
            ClusterError::Entropy(_) => ErrorKind::BackendUnavailable,
        }
    }

    /// Whether this is a lookup miss rather than malformed input.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClusterError::PodNotFound(_) | ClusterError::NodeNotFound(_) | ClusterError::JobNotFound(_)
        )
    }
}
