use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rocksdb::{
    ColumnFamily,
    ColumnFamilyDescriptor,
    Direction,
    ErrorKind,
    IteratorMode,
    Options as RocksDBOptions,
    TransactionDB,
    TransactionDBOptions,
};
use strum::IntoEnumIterator;
use tracing::{error, info};

use super::{Entry, Error, Table, Version, VersionedStore, VersionedValue};

const VERSION_LEN: usize = std::mem::size_of::<Version>();

/// Driver backed by a RocksDB transaction database. Every table is a column
/// family, every value is stored behind its 8 byte big endian version.
pub struct RocksDBStore {
    db: TransactionDB,
    next_version: AtomicU64,
}

impl RocksDBStore {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut db_opts = RocksDBOptions::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let column_families = Table::iter()
            .map(|table| ColumnFamilyDescriptor::new(table.as_ref(), RocksDBOptions::default()));

        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &TransactionDBOptions::default(),
            path,
            column_families,
        )
        .map_err(|source| Error::Unrecoverable {
            source: anyhow!("failed to open RocksDB database at {}: {source}", path.display()),
        })?;
        info!(path = %path.display(), "opened rocksdb state store");

        // Versions must never repeat across restarts, so they are seeded from
        // the wall clock in microseconds.
        let seed = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Ok(Self {
            db,
            next_version: AtomicU64::new(seed),
        })
    }

    fn next_version(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn column_family(&self, table: Table) -> Result<&ColumnFamily, Error> {
        self.db.cf_handle(table.as_ref()).ok_or_else(|| Error::Unrecoverable {
            source: anyhow!("failed to get column family handle for {table}"),
        })
    }
}

fn map_rocksdb_error(table: Table, key: &str, err: rocksdb::Error) -> Error {
    match err.kind() {
        ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::TimedOut => Error::conflict(table, key),
        ErrorKind::Corruption => {
            error!(%table, key, "rocksdb corruption: {err}");
            Error::Unrecoverable {
                source: anyhow!("rocksdb corruption: {err}"),
            }
        }
        _ => Error::Unknown {
            source: anyhow!("rocksdb failure: {err}"),
        },
    }
}

fn encode_stored(version: Version, value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(VERSION_LEN + value.len());
    buf.put_u64(version);
    buf.put_slice(value);
    buf.freeze()
}

fn decode_stored(table: Table, key: &str, stored: &[u8]) -> Result<(Version, Bytes), Error> {
    if stored.len() < VERSION_LEN {
        return Err(Error::Unrecoverable {
            source: anyhow!("stored value too short for a version. table: {table}, key: {key}"),
        });
    }
    let (version, value) = stored.split_at(VERSION_LEN);
    let mut version_bytes = [0u8; VERSION_LEN];
    version_bytes.copy_from_slice(version);
    Ok((
        Version::from_be_bytes(version_bytes),
        Bytes::copy_from_slice(value),
    ))
}

#[async_trait]
impl VersionedStore for RocksDBStore {
    async fn read(&self, table: Table, key: &str) -> Result<VersionedValue, Error> {
        let cf = self.column_family(table)?;
        let stored = self
            .db
            .get_cf(cf, key)
            .map_err(|e| map_rocksdb_error(table, key, e))?
            .ok_or_else(|| Error::not_found(table, key))?;
        let (version, value) = decode_stored(table, key, &stored)?;
        Ok(VersionedValue { value, version })
    }

    async fn create(&self, table: Table, key: &str, value: Bytes) -> Result<Version, Error> {
        let cf = self.column_family(table)?;
        let tx = self.db.transaction();
        let existing = tx
            .get_for_update_cf(cf, key, true)
            .map_err(|e| map_rocksdb_error(table, key, e))?;
        if existing.is_some() {
            return Err(Error::already_exists(table, key));
        }
        let version = self.next_version();
        tx.put_cf(cf, key, encode_stored(version, &value))
            .map_err(|e| map_rocksdb_error(table, key, e))?;
        tx.commit().map_err(|e| map_rocksdb_error(table, key, e))?;
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        key: &str,
        expected: Version,
        value: Bytes,
    ) -> Result<Version, Error> {
        let cf = self.column_family(table)?;
        let tx = self.db.transaction();
        let stored = tx
            .get_for_update_cf(cf, key, true)
            .map_err(|e| map_rocksdb_error(table, key, e))?
            .ok_or_else(|| Error::not_found(table, key))?;
        let (current, _) = decode_stored(table, key, &stored)?;
        if current != expected {
            return Err(Error::conflict(table, key));
        }
        let version = self.next_version();
        tx.put_cf(cf, key, encode_stored(version, &value))
            .map_err(|e| map_rocksdb_error(table, key, e))?;
        tx.commit().map_err(|e| map_rocksdb_error(table, key, e))?;
        Ok(version)
    }

    async fn compare_and_delete(
        &self,
        table: Table,
        key: &str,
        expected: Version,
    ) -> Result<(), Error> {
        let cf = self.column_family(table)?;
        let tx = self.db.transaction();
        let stored = tx
            .get_for_update_cf(cf, key, true)
            .map_err(|e| map_rocksdb_error(table, key, e))?
            .ok_or_else(|| Error::not_found(table, key))?;
        let (current, _) = decode_stored(table, key, &stored)?;
        if current != expected {
            return Err(Error::conflict(table, key));
        }
        tx.delete_cf(cf, key)
            .map_err(|e| map_rocksdb_error(table, key, e))?;
        tx.commit().map_err(|e| map_rocksdb_error(table, key, e))
    }

    async fn list_prefix(&self, table: Table, prefix: &str) -> Result<Vec<Entry>, Error> {
        let cf = self.column_family(table)?;
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut entries = Vec::new();
        for item in iter {
            let (key, stored) = item.map_err(|e| map_rocksdb_error(table, prefix, e))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec()).map_err(|e| Error::Unrecoverable {
                source: anyhow!("non utf8 key in {table}: {e}"),
            })?;
            let (version, value) = decode_stored(table, &key, &stored)?;
            entries.push(Entry {
                key,
                value,
                version,
            });
        }
        Ok(entries)
    }
}
