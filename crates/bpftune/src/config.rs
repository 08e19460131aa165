//! Daemon configuration

use anyhow::Result;
use bpftune_lib::supervisor::{SupervisorConfig, DEFAULT_PLUGIN_DIR};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, sourced from `BPFTUNE_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Per-namespace writes enabled (0/1)
    #[serde(default = "default_netns")]
    pub netns: u8,

    /// Plugin directory rescan interval in milliseconds
    #[serde(default = "default_rescan_ms")]
    pub rescan_ms: u64,

    /// Correlation threshold above which increases are suppressed
    #[serde(default = "default_corr_threshold")]
    pub corr_threshold: f64,

    /// Event dedup window in milliseconds
    #[serde(default = "default_dedup_ms")]
    pub dedup_ms: u64,

    /// Directory scanned for tuner artifacts
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_netns() -> u8 {
    1
}

fn default_rescan_ms() -> u64 {
    5000
}

fn default_corr_threshold() -> f64 {
    0.5
}

fn default_dedup_ms() -> u64 {
    25
}

fn default_plugin_dir() -> String {
    DEFAULT_PLUGIN_DIR.to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            netns: default_netns(),
            rescan_ms: default_rescan_ms(),
            corr_threshold: default_corr_threshold(),
            dedup_ms: default_dedup_ms(),
            plugin_dir: default_plugin_dir(),
            api_port: default_api_port(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("BPFTUNE"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    /// Supervisor configuration derived from the daemon settings
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            plugin_dir: PathBuf::from(&self.plugin_dir),
            rescan_interval: Duration::from_millis(self.rescan_ms),
            dedup_window: Duration::from_millis(self.dedup_ms),
            corr_threshold: self.corr_threshold,
            netns_enabled: self.netns != 0,
            ..SupervisorConfig::default()
        }
    }
}
