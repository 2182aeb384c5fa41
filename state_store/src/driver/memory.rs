use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{Entry, Error, Table, Version, VersionedStore, VersionedValue};

/// Ordered in-memory driver. Versions come from a single counter, so a key
/// that is deleted and recreated never reuses a version.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<(Table, String), (Bytes, Version)>>,
    next_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn read(&self, table: Table, key: &str) -> Result<VersionedValue, Error> {
        let records = self.records.read().await;
        let (value, version) = records
            .get(&(table, key.to_string()))
            .ok_or_else(|| Error::not_found(table, key))?;
        Ok(VersionedValue {
            value: value.clone(),
            version: *version,
        })
    }

    async fn create(&self, table: Table, key: &str, value: Bytes) -> Result<Version, Error> {
        let mut records = self.records.write().await;
        let record_key = (table, key.to_string());
        if records.contains_key(&record_key) {
            return Err(Error::already_exists(table, key));
        }
        let version = self.next_version();
        records.insert(record_key, (value, version));
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        key: &str,
        expected: Version,
        value: Bytes,
    ) -> Result<Version, Error> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&(table, key.to_string())) else {
            return Err(Error::not_found(table, key));
        };
        if record.1 != expected {
            return Err(Error::conflict(table, key));
        }
        let version = self.next_version();
        *record = (value, version);
        Ok(version)
    }

    async fn compare_and_delete(
        &self,
        table: Table,
        key: &str,
        expected: Version,
    ) -> Result<(), Error> {
        let mut records = self.records.write().await;
        let record_key = (table, key.to_string());
        match records.get(&record_key) {
            None => Err(Error::not_found(table, key)),
            Some((_, version)) if *version != expected => Err(Error::conflict(table, key)),
            Some(_) => {
                records.remove(&record_key);
                Ok(())
            }
        }
    }

    async fn list_prefix(&self, table: Table, prefix: &str) -> Result<Vec<Entry>, Error> {
        let records = self.records.read().await;
        let entries = records
            .range((table, prefix.to_string())..)
            .take_while(|((t, key), _)| *t == table && key.starts_with(prefix))
            .map(|((_, key), (value, version))| Entry {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect();
        Ok(entries)
    }
}
