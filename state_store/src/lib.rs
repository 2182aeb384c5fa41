use std::{fmt::Debug, sync::Arc, time::Duration};

use anyhow::anyhow;
use data_model::{
    ActualLrp,
    DefaultRestartPolicy,
    DesiredLrpRunInfo,
    DesiredLrpSchedulingInfo,
    DomainMarker,
    RestartPolicy,
};
use lrp_utils::{Clock, RetryPolicy, SystemClock};
use metrics::{StateStoreMetrics, Timer};
use opentelemetry::KeyValue;
use serde::{de::DeserializeOwned, Serialize};
use serializer::{JsonEncode, JsonEncoder};
use tracing::{debug, warn};

pub mod desired;
pub mod domains;
pub mod driver;
pub mod events;
pub mod serializer;
pub mod state_machine;
pub mod test_state_store;

pub use driver::{Error, MemoryStore, RocksDBStore, Table, Version, VersionedStore};
pub use events::{
    calculate_events,
    record_change,
    ActualLrpCrashedEvent,
    ActualLrpEvents,
    ActualLrpGroupEvent,
    ActualLrpInstanceEvent,
    EventHub,
};
pub use state_machine::{ActualLrpChange, CrashOutcome};

/// A record kept in one of the store tables.
pub trait StoredRecord: Serialize + DeserializeOwned + Debug + PartialEq + Send + Sync {
    fn validate(&self) -> anyhow::Result<()>;
}

impl StoredRecord for ActualLrp {
    fn validate(&self) -> anyhow::Result<()> {
        ActualLrp::validate(self)
    }
}

impl StoredRecord for DesiredLrpSchedulingInfo {
    fn validate(&self) -> anyhow::Result<()> {
        DesiredLrpSchedulingInfo::validate(self)
    }
}

impl StoredRecord for DesiredLrpRunInfo {
    fn validate(&self) -> anyhow::Result<()> {
        DesiredLrpRunInfo::validate(self)
    }
}

impl StoredRecord for DomainMarker {
    fn validate(&self) -> anyhow::Result<()> {
        if self.domain.is_empty() {
            return Err(anyhow!("domain cannot be empty"));
        }
        Ok(())
    }
}

/// A record that failed to decode or validate during a scan.
#[derive(Debug)]
pub struct InvalidRecord {
    pub table: Table,
    pub key: String,
    pub version: Version,
    pub error: anyhow::Error,
}

#[derive(Debug)]
pub struct Scan<T> {
    pub records: Vec<(T, Version)>,
    pub invalid: Vec<InvalidRecord>,
}

impl<T> Default for Scan<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            invalid: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    /// A crash of an instance that has been running for longer than this
    /// resets its crash count.
    pub crash_reset_timeout: Duration,
    /// Applied to desired record updates that lose a compare-and-swap race.
    pub desired_update_retry: RetryPolicy,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            crash_reset_timeout: Duration::from_secs(5 * 60),
            desired_update_retry: RetryPolicy::new(
                5,
                lrp_utils::Backoff::Exponential {
                    initial_ms: 10,
                    max_ms: 500,
                    jitter: true,
                },
            ),
        }
    }
}

/// Versioned records of the LRP consistency core. Operations are split
/// across `state_machine`, `desired` and `domains`.
pub struct StateStore {
    db: Arc<dyn VersionedStore>,
    clock: Arc<dyn Clock>,
    restart_policy: Arc<dyn RestartPolicy>,
    config: StateStoreConfig,
    metrics: StateStoreMetrics,
}

impl StateStore {
    pub fn new(
        db: Arc<dyn VersionedStore>,
        clock: Arc<dyn Clock>,
        restart_policy: Arc<dyn RestartPolicy>,
        config: StateStoreConfig,
    ) -> Self {
        Self {
            db,
            clock,
            restart_policy,
            config,
            metrics: StateStoreMetrics::new(),
        }
    }

    /// In-memory store with the system clock and default policies.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            Arc::new(DefaultRestartPolicy::default()),
            StateStoreConfig::default(),
        )
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn restart_policy(&self) -> &Arc<dyn RestartPolicy> {
        &self.restart_policy
    }

    pub fn config(&self) -> &StateStoreConfig {
        &self.config
    }

    async fn read_record<T: StoredRecord>(&self, table: Table, key: &str) -> Result<(T, Version), Error> {
        let labels = [KeyValue::new("table", table.as_ref().to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, &labels);

        let stored = self.db.read(table, key).await?;
        let record = decode_record::<T>(&stored.value)
            .map_err(|source| Error::invalid_record(table, key, source))?;
        Ok((record, stored.version))
    }

    async fn create_record<T: StoredRecord>(&self, table: Table, key: &str, record: &T) -> Result<Version, Error> {
        let labels = [KeyValue::new("table", table.as_ref().to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.state_write, &labels);

        let value = JsonEncoder::encode(record)?;
        self.db.create(table, key, value).await
    }

    /// Compare-and-swap of a typed record. A conflicting write whose stored
    /// value already equals `record` counts as applied.
    async fn swap_record<T: StoredRecord>(
        &self,
        table: Table,
        key: &str,
        expected: Version,
        record: &T,
    ) -> Result<(), Error> {
        let labels = [KeyValue::new("table", table.as_ref().to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.state_write, &labels);

        let value = JsonEncoder::encode(record)?;
        match self.db.compare_and_swap(table, key, expected, value).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_retryable() => {
                self.metrics.conflicts.add(1, &labels);
                match self.read_record::<T>(table, key).await {
                    Ok((stored, _)) if stored == *record => {
                        debug!(%table, key, "conflicting write already applied");
                        Ok(())
                    }
                    _ => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_record(&self, table: Table, key: &str, expected: Version) -> Result<(), Error> {
        let labels = [KeyValue::new("table", table.as_ref().to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.state_write, &labels);

        let result = self.db.compare_and_delete(table, key, expected).await;
        if matches!(&result, Err(err) if err.is_retryable()) {
            self.metrics.conflicts.add(1, &labels);
        }
        result
    }

    /// Lists and decodes every record under `prefix`. Records that fail to
    /// decode or validate are reported separately instead of failing the
    /// scan.
    async fn scan<T: StoredRecord>(&self, table: Table, prefix: &str) -> Result<Scan<T>, Error> {
        let labels = [KeyValue::new("table", table.as_ref().to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, &labels);

        let mut scan = Scan::default();
        for entry in self.db.list_prefix(table, prefix).await? {
            match decode_record::<T>(&entry.value) {
                Ok(record) => scan.records.push((record, entry.version)),
                Err(error) => {
                    warn!(%table, key = entry.key, "invalid record: {error:#}");
                    scan.invalid.push(InvalidRecord {
                        table,
                        key: entry.key,
                        version: entry.version,
                        error,
                    });
                }
            }
        }
        Ok(scan)
    }

    /// Deletes a record found invalid or orphaned during a scan. Returns
    /// false when the record changed or vanished since it was scanned.
    pub async fn prune(&self, table: Table, key: &str, version: Version) -> Result<bool, Error> {
        match self.delete_record(table, key, version).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_retryable() || err.is_not_found() => {
                debug!(%table, key, "skipping prune of a record that changed: {err}");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

fn decode_record<T: StoredRecord>(bytes: &[u8]) -> anyhow::Result<T> {
    let record: T = JsonEncoder::decode(bytes)?;
    record.validate()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use bytes::Bytes;
    use data_model::{test_objects::tests::mock_actual_lrp, ActualLrpState};

    use super::{test_state_store::TestStateStore, *};

    #[tokio::test]
    async fn test_scan_reports_invalid_records() -> Result<()> {
        let test = TestStateStore::new();
        let lrp = mock_actual_lrp("guid", 0, ActualLrpState::Unclaimed, "");
        test.store
            .create_record(Table::ActualLrps, &lrp.store_key(), &lrp)
            .await?;
        test.store
            .db
            .create(Table::ActualLrps, "guid/bogus", Bytes::from_static(b"{not json"))
            .await?;

        let scan: Scan<ActualLrp> = test.store.scan(Table::ActualLrps, "guid/").await?;
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.invalid.len(), 1);
        assert_eq!(scan.invalid[0].key, "guid/bogus");

        let invalid = &scan.invalid[0];
        assert!(test.store.prune(invalid.table, &invalid.key, invalid.version).await?);
        assert!(!test.store.prune(invalid.table, &invalid.key, invalid.version).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_conflicting_write_with_equal_value_is_applied() -> Result<()> {
        let test = TestStateStore::new();
        let lrp = mock_actual_lrp("guid", 0, ActualLrpState::Unclaimed, "");
        let key = lrp.store_key();
        let v1 = test.store.create_record(Table::ActualLrps, &key, &lrp).await?;

        let mut updated = lrp.clone();
        updated.version.increment();
        test.store
            .swap_record(Table::ActualLrps, &key, v1, &updated)
            .await?;

        // Same write again with the stale version: already applied.
        test.store
            .swap_record(Table::ActualLrps, &key, v1, &updated)
            .await?;

        // A different write with the stale version is a conflict.
        let mut other = updated.clone();
        other.placement_error = Some("no capacity".to_string());
        let err = test
            .store
            .swap_record(Table::ActualLrps, &key, v1, &other)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        Ok(())
    }
}
