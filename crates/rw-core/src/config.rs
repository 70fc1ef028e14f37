use crate::model::Family;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, usually loaded from `/etc/ruleward/ruleward.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the staged restore payloads
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Upper bound for every external command (dump, restore, single rule)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub use_sudo: bool,
    /// Pending-queue depth at which a warning is logged
    #[serde(default = "default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Rule documents re-asserted on every cycle by `ruleward run`
    #[serde(default)]
    pub rule_files: Vec<PathBuf>,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse engine config YAML")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config from {:?}", path))?;
        Self::from_yaml(&content)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }

    /// Well-known staging file for a family's restore payload
    pub fn staging_path(&self, family: Family) -> PathBuf {
        self.staging_dir.join(family.iptables())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            command_timeout_secs: default_command_timeout(),
            use_sudo: false,
            queue_warn_threshold: default_queue_warn_threshold(),
            cycle_interval_secs: default_cycle_interval(),
            rule_files: vec![],
            metrics_port: None,
        }
    }
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/run/ruleward")
}

fn default_command_timeout() -> u64 {
    30
}

fn default_queue_warn_threshold() -> usize {
    10_000
}

fn default_cycle_interval() -> u64 {
    5
}
