//! Error types for the presence store.

use duet_core::ConnectionId;
use thiserror::Error;

/// A result type using `PresenceError`.
pub type Result<T> = std::result::Result<T, PresenceError>;

/// Errors that can occur during presence operations.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// No lease is registered for the given connection token.
    #[error("no lease registered for connection {0}")]
    LeaseNotFound(ConnectionId),
}
