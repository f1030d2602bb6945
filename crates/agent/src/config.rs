//! Agent process configuration
//!
//! Read from `AGENT_*` environment variables. The optimizer's own settings
//! live in the JSON document at `config_path`.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name attached to structured log events
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/state
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Optimizer configuration document, created with defaults if absent
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    #[serde(default = "default_procfs_root")]
    pub procfs_root: PathBuf,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_config_path() -> PathBuf {
    PathBuf::from("config/default.json")
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_procfs_root() -> PathBuf {
    PathBuf::from("/proc")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            config_path: default_config_path(),
            sysfs_root: default_sysfs_root(),
            procfs_root: default_procfs_root(),
        }
    }
}

impl AgentConfig {
    /// Load from the environment; unparseable values fall back to defaults
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid agent configuration, using defaults");
            AgentConfig::default()
        }))
    }
}
