use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker tasks draining the dispatch queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Drop a run's state entry from the store once the run is finalized.
    /// Off by default so finished runs stay inspectable.
    #[serde(default)]
    pub evict_finished_runs: bool,
}

fn default_workers() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            evict_finished_runs: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read configuration file")?;
        toml::from_str(&content).context("Failed to parse configuration file")
    }
}
