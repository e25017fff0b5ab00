//! minicloud-state — the in-memory cluster registry.
//!
//! Holds the pods, their nodes and every job record, together with the
//! indices the scheduler and elasticity controller depend on. The registry
//! is plain data; sharing across tasks is done by wrapping a [`Cluster`] in
//! an async mutex at the call site.

pub mod cluster;
pub mod error;
pub mod ids;
pub mod types;

pub use cluster::{Cluster, ClusterSettings, DEFAULT_POD};
pub use error::{ClusterError, ClusterResult, ErrorKind};
pub use types::*;
