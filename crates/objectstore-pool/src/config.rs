//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long an unreferenced connection stays open, in milliseconds
    pub idle_grace_ms: u64,
    /// Interval of the background sweep, in milliseconds
    pub sweep_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_grace_ms: 5_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle grace period.
    pub fn idle_grace(mut self, ms: u64) -> Self {
        self.idle_grace_ms = ms;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn idle_grace_duration(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn sweep_interval_duration(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
