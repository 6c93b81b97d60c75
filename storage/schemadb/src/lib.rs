// Copyright © Sawtooth Contributors
// SPDX-License-Identifier: Apache-2.0

//! A thin, typed layer over RocksDB column families.
//!
//! Each logical table is described by a [`Schema`]: a column-family name plus
//! key and value codecs. Multi-table mutations are staged in a
//! [`SchemaBatch`] and written atomically with [`DB::write_schemas`], which
//! is what makes chain-head commit/decommit an all-or-nothing operation.

pub mod schema;

pub use schema::{KeyCodec, Schema, ValueCodec};

use rocksdb::{ColumnFamilyDescriptor, DBIteratorWithThreadMode, Direction, IteratorMode, Options};
use sawtooth_infallible::Mutex;
use std::{marker::PhantomData, path::Path};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("store corruption: {0}")]
    Corruption(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An atomic set of writes spanning any number of schemas.
#[derive(Default)]
pub struct SchemaBatch {
    rows: Mutex<Vec<(&'static str, WriteOp)>>,
}

impl SchemaBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<S: Schema>(&self, key: &S::Key, value: &S::Value) -> Result<(), StoreError> {
        let key = key.encode_key()?;
        let value = value.encode_value()?;
        self.rows
            .lock()
            .push((S::COLUMN_FAMILY_NAME, WriteOp::Put { key, value }));
        Ok(())
    }

    pub fn delete<S: Schema>(&self, key: &S::Key) -> Result<(), StoreError> {
        let key = key.encode_key()?;
        self.rows
            .lock()
            .push((S::COLUMN_FAMILY_NAME, WriteOp::Delete { key }));
        Ok(())
    }
}

/// A RocksDB database with a fixed set of named column families.
pub struct DB {
    name: &'static str,
    inner: rocksdb::DB,
}

impl DB {
    /// Opens (creating if missing) the database and all column families.
    pub fn open<P: AsRef<Path>>(
        path: P,
        name: &'static str,
        column_families: &[&str],
    ) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs: Vec<ColumnFamilyDescriptor> = column_families
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(*cf, Options::default()))
            .collect();

        let inner = rocksdb::DB::open_cf_descriptors(&opts, path.as_ref(), cfs)?;
        info!(db = name, path = %path.as_ref().display(), "opened database");
        Ok(Self { name, inner })
    }

    fn cf_handle(&self, cf_name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.inner.cf_handle(cf_name).ok_or_else(|| {
            StoreError::Corruption(format!("{}: missing column family {cf_name}", self.name))
        })
    }

    pub fn get<S: Schema>(&self, key: &S::Key) -> Result<Option<S::Value>, StoreError> {
        let cf = self.cf_handle(S::COLUMN_FAMILY_NAME)?;
        let raw = self.inner.get_cf(cf, key.encode_key()?)?;
        raw.map(|bytes| S::Value::decode_value(&bytes)).transpose()
    }

    pub fn put<S: Schema>(&self, key: &S::Key, value: &S::Value) -> Result<(), StoreError> {
        let cf = self.cf_handle(S::COLUMN_FAMILY_NAME)?;
        self.inner
            .put_cf(cf, key.encode_key()?, value.encode_value()?)?;
        Ok(())
    }

    pub fn delete<S: Schema>(&self, key: &S::Key) -> Result<(), StoreError> {
        let cf = self.cf_handle(S::COLUMN_FAMILY_NAME)?;
        self.inner.delete_cf(cf, key.encode_key()?)?;
        Ok(())
    }

    /// Applies every staged operation in one RocksDB write batch.
    pub fn write_schemas(&self, batch: SchemaBatch) -> Result<(), StoreError> {
        let mut write_batch = rocksdb::WriteBatch::default();
        for (cf_name, op) in batch.rows.into_inner() {
            let cf = self.cf_handle(cf_name)?;
            match op {
                WriteOp::Put { key, value } => write_batch.put_cf(cf, key, value),
                WriteOp::Delete { key } => write_batch.delete_cf(cf, key),
            }
        }
        self.inner.write(write_batch)?;
        Ok(())
    }

    /// Iterates a whole column family in key order.
    pub fn iter<S: Schema>(&self) -> Result<SchemaIterator<'_, S>, StoreError> {
        let cf = self.cf_handle(S::COLUMN_FAMILY_NAME)?;
        Ok(SchemaIterator {
            inner: self.inner.iterator_cf(cf, IteratorMode::Start),
            phantom: PhantomData,
        })
    }

    /// Iterates forward starting at `key` (inclusive).
    pub fn iter_from<S: Schema>(&self, key: &S::Key) -> Result<SchemaIterator<'_, S>, StoreError> {
        let cf = self.cf_handle(S::COLUMN_FAMILY_NAME)?;
        let encoded = key.encode_key()?;
        Ok(SchemaIterator {
            inner: self
                .inner
                .iterator_cf(cf, IteratorMode::From(&encoded, Direction::Forward)),
            phantom: PhantomData,
        })
    }
}

pub struct SchemaIterator<'a, S> {
    inner: DBIteratorWithThreadMode<'a, rocksdb::DB>,
    phantom: PhantomData<S>,
}

impl<S: Schema> Iterator for SchemaIterator<'_, S> {
    type Item = Result<(S::Key, S::Value), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(entry.map_err(StoreError::from).and_then(|(key, value)| {
            Ok((S::Key::decode_key(&key)?, S::Value::decode_value(&value)?))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};
    use claims::{assert_none, assert_ok, assert_some_eq};

    crate::define_schema!(TestSchema, u64, String, "test");

    impl KeyCodec<TestSchema> for u64 {
        fn encode_key(&self) -> Result<Vec<u8>, StoreError> {
            let mut buf = [0u8; 8];
            BigEndian::write_u64(&mut buf, *self);
            Ok(buf.to_vec())
        }

        fn decode_key(data: &[u8]) -> Result<Self, StoreError> {
            if data.len() != 8 {
                return Err(StoreError::Codec("bad u64 key length".into()));
            }
            Ok(BigEndian::read_u64(data))
        }
    }

    impl ValueCodec<TestSchema> for String {
        fn encode_value(&self) -> Result<Vec<u8>, StoreError> {
            Ok(self.as_bytes().to_vec())
        }

        fn decode_value(data: &[u8]) -> Result<Self, StoreError> {
            String::from_utf8(data.to_vec()).map_err(|e| StoreError::Codec(e.to_string()))
        }
    }

    fn open_test_db(dir: &tempfile::TempDir) -> DB {
        DB::open(dir.path(), "test-db", &["test"]).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);

        assert_none!(db.get::<TestSchema>(&7).unwrap());
        assert_ok!(db.put::<TestSchema>(&7, &"seven".to_string()));
        assert_some_eq!(db.get::<TestSchema>(&7).unwrap(), "seven".to_string());
        assert_ok!(db.delete::<TestSchema>(&7));
        assert_none!(db.get::<TestSchema>(&7).unwrap());
    }

    #[test]
    fn batch_is_atomic_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);

        let batch = SchemaBatch::new();
        batch.put::<TestSchema>(&1, &"one".to_string()).unwrap();
        batch.put::<TestSchema>(&2, &"two".to_string()).unwrap();
        // A later delete of an earlier put in the same batch wins.
        batch.delete::<TestSchema>(&1).unwrap();
        assert_ok!(db.write_schemas(batch));

        assert_none!(db.get::<TestSchema>(&1).unwrap());
        assert_some_eq!(db.get::<TestSchema>(&2).unwrap(), "two".to_string());
    }

    #[test]
    fn iteration_is_big_endian_key_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);
        for num in [5u64, 1, 300, 2] {
            db.put::<TestSchema>(&num, &num.to_string()).unwrap();
        }
        let keys: Vec<u64> = db
            .iter::<TestSchema>()
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(keys, vec![1, 2, 5, 300]);

        let from: Vec<u64> = db
            .iter_from::<TestSchema>(&2)
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(from, vec![2, 5, 300]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = open_test_db(&dir);
            db.put::<TestSchema>(&9, &"nine".to_string()).unwrap();
        }
        let db = open_test_db(&dir);
        assert_some_eq!(db.get::<TestSchema>(&9).unwrap(), "nine".to_string());
    }
}
