use std::time::Duration;

use lrp_utils::elapsed_since;
use serde::{Deserialize, Serialize};

/// Decides what happens to an instance after it crashes.
pub trait RestartPolicy: Send + Sync {
    /// Whether a crash with the given count is demoted straight back to
    /// Unclaimed instead of staying Crashed.
    fn should_restart_immediately(&self, crash_count: u32) -> bool;

    /// Whether a Crashed instance that has been in that state since `since`
    /// is due for a restart at `now`. Both are epoch milliseconds.
    fn should_restart(&self, now: u64, since: u64, crash_count: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    pub immediate_restarts: u32,
    pub max_crash_count: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            immediate_restarts: 3,
            max_crash_count: 200,
            initial_backoff_ms: 30_000,
            max_backoff_ms: 16 * 60 * 1000,
        }
    }
}

/// Restarts the first few crashes right away, then backs off exponentially
/// until the crash count exceeds the configured maximum.
#[derive(Debug, Clone, Default)]
pub struct DefaultRestartPolicy {
    config: RestartPolicyConfig,
}

impl DefaultRestartPolicy {
    pub fn new(config: RestartPolicyConfig) -> Self {
        Self { config }
    }

    pub fn backoff_for(&self, crash_count: u32) -> Duration {
        let exp = crash_count
            .saturating_sub(self.config.immediate_restarts)
            .saturating_sub(1)
            .min(32);
        let backoff_ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(backoff_ms)
    }
}

impl RestartPolicy for DefaultRestartPolicy {
    fn should_restart_immediately(&self, crash_count: u32) -> bool {
        crash_count <= self.config.immediate_restarts
    }

    fn should_restart(&self, now: u64, since: u64, crash_count: u32) -> bool {
        if self.should_restart_immediately(crash_count) {
            return true;
        }
        if crash_count > self.config.max_crash_count {
            return false;
        }
        elapsed_since(since, now) >= self.backoff_for(crash_count)
    }
}
