//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary user documents, keyed by `user_id`.
    pub const USERS: &str = "users";

    /// Primary partner request records, keyed by `request_id`.
    pub const REQUESTS: &str = "requests";

    /// Index: requests by recipient, keyed by `recipient_id || request_id`.
    pub const REQUESTS_BY_RECIPIENT: &str = "requests_by_recipient";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::USERS, cf::REQUESTS, cf::REQUESTS_BY_RECIPIENT]
}
