//! minicloud-scheduler — node assignment, provisioning and job lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ClusterManager
//!   ├── Scheduler     (available queue, atomic check-pop-mark)
//!   ├── Provisioner   (pods, nodes, servers; per-pod guards, rollback)
//!   └── JobLifecycle  (launch / complete / abort, bundles, logs, notices)
//!          │
//!          └── ExecutionBackend (minicloud-backend)
//! ```
//!
//! All three share one `Arc<Mutex<Cluster>>`. The mutex is never held
//! across a backend call or any other I/O.

pub mod bundle;
pub mod error;
pub mod lifecycle;
pub mod logs;
pub mod manager;
pub mod notify;
pub mod provision;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use lifecycle::{CompletionReport, JobLifecycle};
pub use manager::ClusterManager;
pub use provision::{NodeSettings, PodGuard, Provisioner, ServerStats};
pub use scheduler::{Scheduler, SharedCluster};
