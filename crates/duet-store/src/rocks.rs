//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use duet_core::{RequestId, UserId};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{PartnerRequest, UserRecord};
use crate::Store;

/// RocksDB-backed storage implementation.
///
/// All multi-record mutations go through a single `WriteBatch`, which
/// `RocksDB` applies atomically. The engine opens one database handle per
/// process, so read-validate-write sequences against it serialize on the
/// store's logical writer.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Stage a user document into a batch.
    fn stage_user(&self, batch: &mut WriteBatch, user: &UserRecord) -> Result<()> {
        let cf_users = self.cf(cf::USERS)?;
        let value = Self::serialize(user)?;
        batch.put_cf(&cf_users, keys::user_key(&user.user_id), value);
        Ok(())
    }

    /// Stage a request record and its recipient index entry into a batch.
    fn stage_request(&self, batch: &mut WriteBatch, request: &PartnerRequest) -> Result<()> {
        let cf_requests = self.cf(cf::REQUESTS)?;
        let cf_by_recipient = self.cf(cf::REQUESTS_BY_RECIPIENT)?;
        let value = Self::serialize(request)?;

        batch.put_cf(&cf_requests, keys::request_key(&request.request_id), value);
        batch.put_cf(
            &cf_by_recipient,
            keys::recipient_request_key(&request.recipient_id, &request.request_id),
            [],
        );
        Ok(())
    }

    /// Commit a batch.
    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Store for RocksStore {
    // =========================================================================
    // User Operations
    // =========================================================================

    fn put_user(&self, user: &UserRecord) -> Result<()> {
        let cf_users = self.cf(cf::USERS)?;
        let value = Self::serialize(user)?;

        self.db
            .put_cf(&cf_users, keys::user_key(&user.user_id), value)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        let cf = self.cf(cf::USERS)?;
        let key = keys::user_key(user_id);

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn list_all_users(&self) -> Result<Vec<UserRecord>> {
        let cf = self.cf(cf::USERS)?;

        let mut users = Vec::new();
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);

        for item in iter {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let user: UserRecord = Self::deserialize(&value)?;
            users.push(user);
        }

        Ok(users)
    }

    fn put_user_pair(&self, a: &UserRecord, b: &UserRecord) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_user(&mut batch, a)?;
        self.stage_user(&mut batch, b)?;
        self.write(batch)
    }

    fn put_pairing(
        &self,
        a: &UserRecord,
        b: &UserRecord,
        request: Option<&PartnerRequest>,
    ) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_user(&mut batch, a)?;
        self.stage_user(&mut batch, b)?;
        if let Some(request) = request {
            self.stage_request(&mut batch, request)?;
        }
        self.write(batch)
    }

    // =========================================================================
    // Request Operations
    // =========================================================================

    fn put_request(&self, request: &PartnerRequest) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_request(&mut batch, request)?;
        self.write(batch)
    }

    fn get_request(&self, request_id: &RequestId) -> Result<Option<PartnerRequest>> {
        let cf = self.cf(cf::REQUESTS)?;
        let key = keys::request_key(request_id);

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn put_request_with_user(&self, request: &PartnerRequest, user: &UserRecord) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_request(&mut batch, request)?;
        self.stage_user(&mut batch, user)?;
        self.write(batch)
    }

    fn list_requests_by_recipient(&self, recipient_id: &UserId) -> Result<Vec<PartnerRequest>> {
        let cf_by_recipient = self.cf(cf::REQUESTS_BY_RECIPIENT)?;
        let prefix = keys::recipient_prefix(recipient_id);

        let mut requests = Vec::new();
        let iter = self.db.iterator_cf(
            &cf_by_recipient,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            // Stop if we're past the prefix
            if !key.starts_with(&prefix) {
                break;
            }

            let request_id = keys::extract_request_id_from_recipient_request_key(&key);
            if let Some(request) = self.get_request(&request_id)? {
                requests.push(request);
            }
        }

        Ok(requests)
    }

    fn delete_request(&self, request_id: &RequestId) -> Result<()> {
        let cf_requests = self.cf(cf::REQUESTS)?;
        let cf_by_recipient = self.cf(cf::REQUESTS_BY_RECIPIENT)?;

        // Get the request to find the recipient
        let request = self.get_request(request_id)?.ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_requests, keys::request_key(request_id));
        batch.delete_cf(
            &cf_by_recipient,
            keys::recipient_request_key(&request.recipient_id, request_id),
        );
        self.write(batch)
    }
}
