use std::{sync::Arc, time::Duration};

use data_model::{DefaultRestartPolicy, RestartPolicyConfig};
use lrp_utils::{Backoff, FakeClock, RetryPolicy};

use crate::{MemoryStore, StateStore, StateStoreConfig};

pub const TEST_NOW: u64 = 1_700_000_000_000;

/// In-memory store driven by a fake clock.
pub struct TestStateStore {
    pub store: Arc<StateStore>,
    /// Raw access for seeding records that no operation would write.
    pub db: Arc<MemoryStore>,
    pub clock: FakeClock,
}

impl TestStateStore {
    pub fn new() -> Self {
        let clock = FakeClock::new(TEST_NOW);
        let db = Arc::new(MemoryStore::new());
        let store = StateStore::new(
            db.clone(),
            Arc::new(clock.clone()),
            Arc::new(DefaultRestartPolicy::new(RestartPolicyConfig::default())),
            StateStoreConfig {
                crash_reset_timeout: Duration::from_secs(5 * 60),
                desired_update_retry: RetryPolicy::new(3, Backoff::None),
            },
        );
        Self {
            store: Arc::new(store),
            db,
            clock,
        }
    }
}

impl Default for TestStateStore {
    fn default() -> Self {
        Self::new()
    }
}
