//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions to encode and decode keys for the primary
//! records and the recipient index. All keys are designed to support
//! efficient prefix scans.

use duet_core::{RequestId, UserId};

/// Encode a user key (just the user ID bytes).
#[must_use]
pub fn user_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Encode a request key (just the request ID bytes).
#[must_use]
pub fn request_key(request_id: &RequestId) -> Vec<u8> {
    request_id.as_bytes().to_vec()
}

/// Encode a recipient-request index key: `recipient_id || request_id`.
///
/// This allows efficient prefix scans for all requests targeting a user.
#[must_use]
pub fn recipient_request_key(recipient_id: &UserId, request_id: &RequestId) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(recipient_id.as_bytes());
    key.extend_from_slice(request_id.as_bytes());
    key
}

/// Encode a recipient prefix for scanning all requests by recipient.
#[must_use]
pub fn recipient_prefix(recipient_id: &UserId) -> Vec<u8> {
    recipient_id.as_bytes().to_vec()
}

/// Extract the request ID from a recipient-request key.
///
/// # Panics
///
/// Panics if the key is not at least 48 bytes.
#[must_use]
pub fn extract_request_id_from_recipient_request_key(key: &[u8]) -> RequestId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[32..48]);
    RequestId::from_uuid(uuid::Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_request_key_roundtrip() {
        let recipient_id = UserId::from_bytes([1u8; 32]);
        let request_id = RequestId::generate();

        let key = recipient_request_key(&recipient_id, &request_id);
        assert_eq!(key.len(), 48);

        let extracted = extract_request_id_from_recipient_request_key(&key);
        assert_eq!(extracted, request_id);
    }

    #[test]
    fn prefix_scan_simulation() {
        let recipient_id = UserId::from_bytes([1u8; 32]);
        let request_id1 = RequestId::generate();
        let request_id2 = RequestId::generate();

        let key1 = recipient_request_key(&recipient_id, &request_id1);
        let key2 = recipient_request_key(&recipient_id, &request_id2);
        let prefix = recipient_prefix(&recipient_id);

        // Both keys should start with the recipient prefix
        assert!(key1.starts_with(&prefix));
        assert!(key2.starts_with(&prefix));
    }
}
