//! Aggregate configuration.

use crate::error::{Result, SwitchboardError};
use crate::events::EventBusConfig;
use crate::pool::PoolConfig;
use crate::state::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for a [`crate::Switchboard`].
///
/// Every field has a default, so a JSON file only needs the keys it changes:
///
/// ```json
/// { "pool": { "heartbeat_interval_ms": 15000 }, "store": { "max_history": 100 } }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub bus: EventBusConfig,
    pub store: StoreConfig,
    pub pool: PoolConfig,
}

impl SwitchboardConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SwitchboardError::Deserialization(e.to_string()))
    }

    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }
}
