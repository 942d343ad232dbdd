use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub worker_mode: Option<String>,
    pub shutdown_grace_secs: Option<u64>,
    pub max_tick_secs: Option<u64>,
    pub reap_interval_secs: Option<u64>,

    pub triggers: Vec<TriggerConfig>,
}

/// A `[[triggers]]` table: a command to run on a schedule.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct TriggerConfig {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    /// One-shot fire time, RFC 3339.
    pub at: Option<String>,
    /// Recurrence interval; mutually exclusive with `at`.
    pub interval_secs: Option<u64>,
    /// Recurrence anchor, RFC 3339. Defaults to start-up time.
    pub anchor: Option<String>,
    pub enabled: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
