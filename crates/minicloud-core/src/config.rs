//! minicloud.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinicloudConfig {
    pub cluster: ClusterConfig,
    pub tiers: HashMap<String, TierConfig>,
    pub address: AddressConfig,
    #[serde(default)]
    pub elasticity: ElasticityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Key into the `[tiers]` table.
    pub tier: String,
    /// Root directory for job bundles and job logs.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_job_image")]
    pub job_image: String,
    #[serde(default = "default_server_image")]
    pub server_image: String,
    #[serde(default)]
    pub server_command: Option<Vec<String>>,
    /// Container-side port a server node listens on.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// First host port handed out to server nodes.
    #[serde(default = "default_port_base")]
    pub port_base: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// CPUs granted to a single node.
    pub cpu_limit: f64,
    /// Memory granted to a single node, either bytes or a size string ("512m").
    pub mem_limit: MemLimit,
    /// Upper bound on the node count of an elastic pod.
    pub node_limit: u32,
    /// CPUs shared among a pod's server nodes. Defaults to `cpu_limit`.
    pub cpu_available: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MemLimit {
    Bytes(u64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressConfig {
    /// Base URL of the upstream manager that receives completion notices.
    pub manager: String,
    /// Base URL of this process as seen from inside a node container.
    pub callback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticityConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_lower_threshold")]
    pub lower_threshold: f64,
    #[serde(default = "default_upper_threshold")]
    pub upper_threshold: f64,
}

impl Default for ElasticityConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            lower_threshold: default_lower_threshold(),
            upper_threshold: default_upper_threshold(),
        }
    }
}

/// Resolved limits of the configured tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierLimits {
    pub name: String,
    pub cpu_limit: f64,
    pub mem_limit: u64,
    pub node_limit: u32,
    pub cpu_available: f64,
}

impl MinicloudConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: MinicloudConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        let tier = self.tier_limits()?;
        if tier.node_limit == 0 {
            anyhow::bail!("tier {}: node_limit must be at least 1", tier.name);
        }
        if tier.cpu_limit <= 0.0 || tier.cpu_available <= 0.0 {
            anyhow::bail!("tier {}: cpu limits must be positive", tier.name);
        }
        let e = &self.elasticity;
        if !(0.0..=100.0).contains(&e.lower_threshold)
            || !(0.0..=100.0).contains(&e.upper_threshold)
        {
            anyhow::bail!("elasticity thresholds must lie within 0..=100");
        }
        if e.lower_threshold >= e.upper_threshold {
            anyhow::bail!(
                "elasticity lower_threshold ({}) must be below upper_threshold ({})",
                e.lower_threshold,
                e.upper_threshold
            );
        }
        if e.interval_ms == 0 {
            anyhow::bail!("elasticity interval_ms must be positive");
        }
        Ok(())
    }

    /// Resolve the `[cluster].tier` entry into concrete limits.
    pub fn tier_limits(&self) -> anyhow::Result<TierLimits> {
        let name = &self.cluster.tier;
        let tier = self
            .tiers
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown cluster tier: {name}"))?;
        let mem_limit = tier
            .mem_limit
            .bytes()
            .ok_or_else(|| anyhow::anyhow!("tier {name}: invalid mem_limit {:?}", tier.mem_limit))?;
        Ok(TierLimits {
            name: name.clone(),
            cpu_limit: tier.cpu_limit,
            mem_limit,
            node_limit: tier.node_limit,
            cpu_available: tier.cpu_available.unwrap_or(tier.cpu_limit),
        })
    }

    /// A single-tier configuration suitable for local runs and tests.
    pub fn scaffold(manager: &str, callback: &str) -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "small".to_string(),
            TierConfig {
                cpu_limit: 0.5,
                mem_limit: MemLimit::Text("512m".to_string()),
                node_limit: 5,
                cpu_available: None,
            },
        );
        MinicloudConfig {
            cluster: ClusterConfig {
                tier: "small".to_string(),
                work_dir: default_work_dir(),
                job_image: default_job_image(),
                server_image: default_server_image(),
                server_command: None,
                server_port: default_server_port(),
                port_base: default_port_base(),
            },
            tiers,
            address: AddressConfig {
                manager: manager.to_string(),
                callback: callback.to_string(),
            },
            elasticity: ElasticityConfig::default(),
        }
    }
}

impl MemLimit {
    /// Resolve to a byte count.
    pub fn bytes(&self) -> Option<u64> {
        match self {
            MemLimit::Bytes(b) => Some(*b),
            MemLimit::Text(s) => parse_size(s),
        }
    }
}

/// Parse a size string like "512m", "2g", "64k" or a bare byte count.
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, multiplier) = match s.chars().last()? {
        'k' => (&s[..s.len() - 1], 1024),
        'm' => (&s[..s.len() - 1], 1024 * 1024),
        'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

fn default_work_dir() -> String {
    "tmp".to_string()
}

fn default_job_image() -> String {
    "ubuntu".to_string()
}

fn default_server_image() -> String {
    "node:20-alpine".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_port_base() -> u16 {
    10000
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_lower_threshold() -> f64 {
    20.0
}

fn default_upper_threshold() -> f64 {
    80.0
}
