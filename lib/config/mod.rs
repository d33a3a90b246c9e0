//! Export targets and pump timing, loaded from a JSON file.
//!
//! ```json
//! {
//!   "targets": {
//!     "archive": {
//!       "client": "file",
//!       "tables": ["orders", "payments"],
//!       "properties": { "outdir": "/var/export", "nonce": "archive" }
//!     }
//!   },
//!   "pump": { "max_backoff_ms": 8000 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pump::PumpConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse export config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("table {table} is routed to both `{first}` and `{second}`")]
    DuplicateTable {
        table: String,
        first: String,
        second: String,
    },

    #[error("invalid export config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Sink client id, resolved through the sink registry.
    pub client: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    pub initial_backoff_ms: u64,
    pub initial_jitter_ms: u64,
    pub max_backoff_ms: u64,
    pub gate_poll_interval_ms: u64,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 10,
            initial_jitter_ms: 10,
            max_backoff_ms: 8000,
            gate_poll_interval_ms: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
    #[serde(default)]
    pub pump: PumpSettings,
}

impl ExportConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, target) in &self.targets {
            if target.client.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target `{name}` has no client"
                )));
            }
        }
        if self.pump.max_backoff_ms < self.pump.initial_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "pump.max_backoff_ms ({}) must be >= pump.initial_backoff_ms ({})",
                self.pump.max_backoff_ms, self.pump.initial_backoff_ms
            )));
        }
        if self.pump.gate_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pump.gate_poll_interval_ms must be > 0".to_string(),
            ));
        }
        table_routes(&self.targets)?;
        Ok(())
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            initial_backoff: Duration::from_millis(self.pump.initial_backoff_ms),
            initial_jitter: Duration::from_millis(self.pump.initial_jitter_ms),
            max_backoff: Duration::from_millis(self.pump.max_backoff_ms),
            gate_poll_interval: Duration::from_millis(self.pump.gate_poll_interval_ms),
        }
    }
}

/// Table identifiers are case-insensitive.
pub fn normalize_table_name(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

/// Maps every table of every enabled target to that target's name.
pub fn table_routes(
    targets: &BTreeMap<String, TargetConfig>,
) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut routes: BTreeMap<String, String> = BTreeMap::new();
    for (target_name, target) in targets.iter().filter(|(_, target)| target.enabled) {
        for table in &target.tables {
            let table = normalize_table_name(table);
            if let Some(first) = routes.get(&table) {
                if first != target_name {
                    return Err(ConfigError::DuplicateTable {
                        table,
                        first: first.clone(),
                        second: target_name.clone(),
                    });
                }
                continue;
            }
            routes.insert(table, target_name.clone());
        }
    }
    Ok(routes)
}
