//! `RocksDB` storage layer for the duet pairing engine.
//!
//! This crate provides durable storage for user documents and partner
//! requests using `RocksDB` with column families.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `users`: Primary user documents, keyed by `user_id`
//! - `requests`: Primary partner request records, keyed by `request_id`
//! - `requests_by_recipient`: Index for listing requests by recipient
//!
//! The pairing invariant (two user documents that always agree about who is
//! partnered with whom) is enforced at this layer: every mutation that
//! touches both sides of a partnership goes through [`Store::put_user_pair`]
//! or [`Store::put_pairing`], each of which commits a single atomic
//! `WriteBatch`.
//!
//! # Example
//!
//! ```no_run
//! use duet_store::{RocksStore, Store, UserRecord};
//! use duet_core::UserId;
//!
//! let store = RocksStore::open("/tmp/duet-db").unwrap();
//!
//! let user_id = UserId::from_bytes([0u8; 32]);
//! let user = UserRecord::new(user_id, "Alice", "alice@example.com");
//! store.put_user(&user).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{link_partners, unlink_partners, InviteCode, PartnerRequest, RequestStatus, UserRecord};

use duet_core::{RequestId, UserId};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different
/// implementations. Any implementation must guarantee that the multi-record
/// methods (`put_user_pair`, `put_pairing`, `put_request_with_user`) commit
/// all of their writes atomically, with serializable behavior between
/// concurrent committers; the pairing invariant depends on it.
pub trait Store: Send + Sync {
    // =========================================================================
    // User Operations
    // =========================================================================

    /// Insert or update a user document.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_user(&self, user: &UserRecord) -> Result<()>;

    /// Get a user by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>>;

    /// List every user document.
    ///
    /// Powers invite-code redemption (codes are not globally indexed, so
    /// redemption scans all users' code inventories) and user search. This
    /// is O(total users) per call — a deliberate low-scale tradeoff.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_all_users(&self) -> Result<Vec<UserRecord>>;

    /// Write both sides of a partnership in one atomic batch.
    ///
    /// Both documents commit together or not at all. Used for pairing via
    /// invite code (the used-code mark lives inside the issuer's document)
    /// and for nulling both sides on disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_user_pair(&self, a: &UserRecord, b: &UserRecord) -> Result<()>;

    /// Write both sides of a partnership plus request bookkeeping in one
    /// atomic batch.
    ///
    /// Used by the accept path, where the request's terminal status must
    /// commit together with the symmetric `partner_id` assignment.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_pairing(
        &self,
        a: &UserRecord,
        b: &UserRecord,
        request: Option<&PartnerRequest>,
    ) -> Result<()>;

    // =========================================================================
    // Request Operations
    // =========================================================================

    /// Insert or update a partner request record.
    ///
    /// This also maintains the recipient index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_request(&self, request: &PartnerRequest) -> Result<()>;

    /// Get a partner request by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_request(&self, request_id: &RequestId) -> Result<Option<PartnerRequest>>;

    /// Write a request record and one user document in one atomic batch.
    ///
    /// Used when sending a request: the new record and the recipient's
    /// pending-list append must commit together.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_request_with_user(&self, request: &PartnerRequest, user: &UserRecord) -> Result<()>;

    /// List all requests targeting a recipient, in index order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_requests_by_recipient(&self, recipient_id: &UserId) -> Result<Vec<PartnerRequest>>;

    /// Delete a request record and its index entry.
    ///
    /// The engine's expiry policy is lazy (expired requests are filtered at
    /// read time); this exists for operational cleanup.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the request doesn't exist.
    fn delete_request(&self, request_id: &RequestId) -> Result<()>;
}
