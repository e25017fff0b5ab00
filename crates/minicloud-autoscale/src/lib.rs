//! minicloud-autoscale — CPU-driven elasticity for server pods.
//!
//! # Control loop
//!
//! ```text
//! every interval, for each elastic pod:
//!     sample ONLINE servers → cpu% against the pod's per-node cap
//!     average = mean(cpu%)
//!
//!     if average > upper and nodes < max:
//!         add one server (auto-XXXXXXXX), recompute cap
//!     elif average < lower and servers > min:
//!         remove the newest server
//! ```
//!
//! Pods with no online server give no signal and are skipped, as are pods
//! whose structural guard is held by a request in flight.

pub mod scaler;

pub use scaler::{ElasticityController, ScaleDecision, evaluate};
