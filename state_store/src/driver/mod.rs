//! The driver module centralizes the logic for reading and writing records
//! in the versioned store.
//!
//! Every driver exposes the same compare-and-swap contract: each record
//! carries an opaque version token, and writes only succeed when the caller
//! presents the token it read. Tests in this module run against every driver
//! so that behaviors stay consistent.

use async_trait::async_trait;
use bytes::Bytes;
use strum::{AsRefStr, EnumIter};

pub mod memory;
pub mod rocksdb;

pub use memory::MemoryStore;
pub use self::rocksdb::RocksDBStore;

/// Opaque per-record version token handed out by a driver.
pub type Version = u64;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Record not found. table: {}, key: {}", table, key)]
    NotFound { table: String, key: String },

    #[error("Record already exists. table: {}, key: {}", table, key)]
    AlreadyExists { table: String, key: String },

    #[error(
        "Record was modified concurrently, the version didn't match. table: {}, key: {}",
        table,
        key
    )]
    Conflict { table: String, key: String },

    #[error("Invalid transition for {}: {} -> {}", key, from, to)]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("Invalid record. table: {}, key: {}, error: {}", table, key, source)]
    InvalidRecord {
        table: String,
        key: String,
        source: anyhow::Error,
    },

    #[error("Unrecoverable store failure. error: {}", source)]
    Unrecoverable { source: anyhow::Error },

    #[error("Unknown store failure. error: {}", source)]
    Unknown {
        #[from]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn not_found(table: Table, key: &str) -> Self {
        Self::NotFound {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn already_exists(table: Table, key: &str) -> Self {
        Self::AlreadyExists {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn conflict(table: Table, key: &str) -> Self {
        Self::Conflict {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn invalid_record(table: Table, key: &str, source: anyhow::Error) -> Self {
        Self::InvalidRecord {
            table: table.to_string(),
            key: key.to_string(),
            source,
        }
    }

    /// Identifies failed operations that can be retried by the caller.
    ///
    /// Only `Self::Conflict` errors are retryable, every other failure will
    /// fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(&self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(&self, Self::NotFound { .. })
    }

    /// Failures that must stop the convergence loop.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(&self, Self::Unrecoverable { .. })
    }
}

/// Tables stored by the drivers. Each table is a column family in RocksDB.
#[derive(
    AsRefStr, strum::Display, EnumIter, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Table {
    ActualLrps,
    DesiredSchedulingInfos,
    DesiredRunInfos,
    Domains,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Bytes,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Bytes,
    pub version: Version,
}

/// Versioned key/value store with atomic compare-and-swap.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Fails with `Error::NotFound` when the key does not exist.
    async fn read(&self, table: Table, key: &str) -> Result<VersionedValue, Error>;

    /// Fails with `Error::AlreadyExists` when the key exists.
    async fn create(&self, table: Table, key: &str, value: Bytes) -> Result<Version, Error>;

    /// Replaces the value when the stored version equals `expected`.
    /// Fails with `Error::Conflict` or `Error::NotFound`.
    async fn compare_and_swap(
        &self,
        table: Table,
        key: &str,
        expected: Version,
        value: Bytes,
    ) -> Result<Version, Error>;

    /// Deletes the key when the stored version equals `expected`.
    /// Fails with `Error::Conflict` or `Error::NotFound`.
    async fn compare_and_delete(
        &self,
        table: Table,
        key: &str,
        expected: Version,
    ) -> Result<(), Error>;

    /// Every entry whose key starts with `prefix`, in key order.
    async fn list_prefix(&self, table: Table, prefix: &str) -> Result<Vec<Entry>, Error>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use super::*;

    fn drivers() -> Result<Vec<(Arc<dyn VersionedStore>, Option<tempfile::TempDir>)>> {
        let dir = tempfile::tempdir()?;
        let memory: Arc<dyn VersionedStore> = Arc::new(MemoryStore::new());
        let rocks: Arc<dyn VersionedStore> = Arc::new(RocksDBStore::open(dir.path())?);
        Ok(vec![(memory, None), (rocks, Some(dir))])
    }

    #[tokio::test]
    async fn test_create_and_read() -> Result<()> {
        for (store, _dir) in drivers()? {
            let version = store
                .create(Table::ActualLrps, "a/1", Bytes::from_static(b"one"))
                .await?;
            let read = store.read(Table::ActualLrps, "a/1").await?;
            assert_eq!(read.value, Bytes::from_static(b"one"));
            assert_eq!(read.version, version);

            let err = store
                .create(Table::ActualLrps, "a/1", Bytes::from_static(b"two"))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::AlreadyExists { .. }));

            let err = store.read(Table::Domains, "a/1").await.unwrap_err();
            assert!(err.is_not_found());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_version() -> Result<()> {
        for (store, _dir) in drivers()? {
            let v1 = store
                .create(Table::ActualLrps, "a/1", Bytes::from_static(b"one"))
                .await?;
            let v2 = store
                .compare_and_swap(Table::ActualLrps, "a/1", v1, Bytes::from_static(b"two"))
                .await?;
            assert_ne!(v1, v2);

            let err = store
                .compare_and_swap(Table::ActualLrps, "a/1", v1, Bytes::from_static(b"three"))
                .await
                .unwrap_err();
            assert!(err.is_retryable());
            assert_eq!(
                store.read(Table::ActualLrps, "a/1").await?.value,
                Bytes::from_static(b"two")
            );

            let err = store
                .compare_and_swap(Table::ActualLrps, "missing", v1, Bytes::new())
                .await
                .unwrap_err();
            assert!(err.is_not_found());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_and_delete() -> Result<()> {
        for (store, _dir) in drivers()? {
            let v1 = store
                .create(Table::Domains, "d", Bytes::from_static(b"x"))
                .await?;
            let err = store
                .compare_and_delete(Table::Domains, "d", v1 + 1000)
                .await
                .unwrap_err();
            assert!(err.is_retryable());

            store.compare_and_delete(Table::Domains, "d", v1).await?;
            let err = store
                .compare_and_delete(Table::Domains, "d", v1)
                .await
                .unwrap_err();
            assert!(err.is_not_found());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_recreated_record_gets_a_new_version() -> Result<()> {
        for (store, _dir) in drivers()? {
            let v1 = store
                .create(Table::Domains, "d", Bytes::from_static(b"x"))
                .await?;
            store.compare_and_delete(Table::Domains, "d", v1).await?;
            let v2 = store
                .create(Table::Domains, "d", Bytes::from_static(b"x"))
                .await?;
            assert_ne!(v1, v2);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_list_prefix_is_ordered_and_scoped() -> Result<()> {
        for (store, _dir) in drivers()? {
            for key in ["b/2", "a/2", "a/1", "ab/1"] {
                store
                    .create(Table::ActualLrps, key, Bytes::from(key.to_string()))
                    .await?;
            }
            store
                .create(Table::Domains, "a/3", Bytes::from_static(b"other table"))
                .await?;

            let keys: Vec<String> = store
                .list_prefix(Table::ActualLrps, "a/")
                .await?
                .into_iter()
                .map(|e| e.key)
                .collect();
            assert_eq!(keys, vec!["a/1".to_string(), "a/2".to_string()]);

            let all = store.list_prefix(Table::ActualLrps, "").await?;
            assert_eq!(all.len(), 4);
        }
        Ok(())
    }
}
