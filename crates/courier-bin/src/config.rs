//! Application configuration.

use anyhow::{Context, Result};
use courier_engine::EngineConfig;
use courier_gateway::HttpGatewayConfig;
use courier_rate::RateConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration, loaded from a JSON file.
///
/// Every section falls back to its defaults, so a partial file (or no
/// file at all) is enough to get a local instance running.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
    pub gateway: HttpGatewayConfig,
    pub rate: RateConfig,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("courier.db"),
            log_json: false,
            gateway: HttpGatewayConfig::default(),
            rate: RateConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}
