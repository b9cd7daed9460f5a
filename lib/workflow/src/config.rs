//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide defaults and limits.
///
/// Every field has a default, so hosts can deserialize partial documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for `agent` and `database` calls without `timeoutMs`.
    pub default_timeout_ms: u64,
    /// Iteration cap for loops without `maxIterations`.
    pub max_loop_iterations: u32,
    /// Join barrier timeout for `merge`/`aggregator` without `timeoutMs`.
    pub join_timeout_ms: u64,
    /// Poll interval of `until` delays without `pollIntervalMs`.
    pub delay_poll_interval_ms: u64,
    /// Upper bound of any single `delay` wait.
    pub max_delay_ms: u64,
    /// Capacity of each run's event broadcast channel.
    pub event_buffer: usize,
    /// Consecutive failures that open a kind's circuit; 0 disables it.
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_loop_iterations: 1000,
            join_timeout_ms: 60_000,
            delay_poll_interval_ms: 100,
            max_delay_ms: 300_000,
            event_buffer: 1024,
            circuit_failure_threshold: 5,
            circuit_recovery_ms: 60_000,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub fn circuit_recovery(&self) -> Duration {
        Duration::from_millis(self.circuit_recovery_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({ "max_loop_iterations": 50 })).unwrap();
        assert_eq!(config.max_loop_iterations, 50);
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.join_timeout_ms, 60_000);
    }
}
