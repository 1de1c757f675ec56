//! Store configuration.

use objectstore_cache::DEFAULT_PRUNE_THRESHOLD;
use objectstore_core::Result;
use objectstore_pool::PoolConfig;
use serde::{Deserialize, Serialize};

/// Configuration of one [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection string handed to the provider
    pub connection_string: String,
    /// Connection pool settings
    pub pool: PoolConfig,
    /// Identity-map inserts between sweeps of dead entries
    pub prune_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            pool: PoolConfig::default(),
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
        }
    }
}

impl StoreConfig {
    /// A configuration for `connection_string` with default settings.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn prune_threshold(mut self, threshold: usize) -> Self {
        self.prune_threshold = threshold;
        self
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
