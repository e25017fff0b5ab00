pub mod config;

pub use config::{MinicloudConfig, TierLimits};
