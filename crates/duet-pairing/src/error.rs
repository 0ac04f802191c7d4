//! Error types for pairing operations.
//!
//! This module defines the full error taxonomy surfaced by the pairing
//! engine, together with the retry classification the backoff wrapper
//! consults and the short user-facing message each error maps to.

use duet_core::{RequestId, UserId};
use duet_presence::PresenceError;
use duet_store::StoreError;
use thiserror::Error;

/// A result type using `PairingError`.
pub type Result<T> = std::result::Result<T, PairingError>;

/// Errors that can occur in pairing operations.
#[derive(Debug, Error)]
pub enum PairingError {
    /// The caller has no user document; the session is not signed in.
    #[error("caller is not signed in")]
    NotLoggedIn,

    /// A targeted user was not found.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// The user already has a partner.
    #[error("user {0} already has a partner")]
    AlreadyPartnered(UserId),

    /// The caller has no partner to disconnect from.
    #[error("no partner to disconnect from")]
    NotConnected,

    /// A user attempted to pair with themselves.
    #[error("cannot pair with yourself")]
    SelfPairing,

    /// The invite code was not found, already used, or expired.
    #[error("invite code is invalid or expired")]
    InvalidOrExpiredCode,

    /// The search term is too short.
    #[error("search term must be at least {min} characters")]
    TermTooShort {
        /// The minimum accepted length.
        min: usize,
    },

    /// The partner request was not found.
    #[error("partner request not found: {0}")]
    RequestNotFound(RequestId),

    /// The partner request has already reached a terminal state.
    #[error("partner request {0} is no longer pending")]
    RequestNoLongerPending(RequestId),

    /// The partner request has passed its expiry.
    #[error("partner request {0} has expired")]
    RequestExpired(RequestId),

    /// The caller is not allowed to act on this request.
    #[error("caller is not authorized to act on this request")]
    NotAuthorized,

    /// The backend rejected the operation outright. Never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The network is unreachable. Retryable.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// An attempt exceeded its deadline. Retryable up to the attempt cap.
    #[error("operation timed out")]
    OperationTimedOut,

    /// The backend failed transiently. Retryable.
    #[error("backend temporarily unavailable: {0}")]
    BackendTransientFailure(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Presence layer error.
    #[error("presence error: {0}")]
    Presence(#[from] PresenceError),
}

impl PairingError {
    /// Returns true if this error must fail immediately, without retry.
    #[must_use]
    pub const fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// Returns true if this error is a transient infrastructure failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable(_) | Self::OperationTimedOut | Self::BackendTransientFailure(_)
        )
    }

    /// Returns true if this error might be resolved by retrying.
    ///
    /// Validation errors are never retryable; they are raised immediately.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable(_)
                | Self::OperationTimedOut
                | Self::BackendTransientFailure(_)
                | Self::Store(_)
        )
    }

    /// The short human-readable message surfaced to the UI.
    ///
    /// No raw backend error text reaches the user.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::NotLoggedIn => "You need to sign in first.",
            Self::UserNotFound(_) => "That user could not be found.",
            Self::AlreadyPartnered(_) => "A partner is already connected.",
            Self::NotConnected => "You are not connected to a partner.",
            Self::SelfPairing => "You can't connect with yourself.",
            Self::InvalidOrExpiredCode => "That invite code is invalid or has expired.",
            Self::TermTooShort { .. } => "Type at least two characters to search.",
            Self::RequestNotFound(_) => "That request no longer exists.",
            Self::RequestNoLongerPending(_) => "That request was already answered.",
            Self::RequestExpired(_) => "That request has expired.",
            Self::NotAuthorized => "You can't act on that request.",
            Self::PermissionDenied(_) => "You don't have permission to do that.",
            Self::NetworkUnavailable(_) => "You appear to be offline. Check your connection.",
            Self::OperationTimedOut => "That took too long. Please try again.",
            Self::BackendTransientFailure(_) | Self::Store(_) | Self::Presence(_) => {
                "Something went wrong. Please try again."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_not_retriable() {
        let user_id = UserId::from_bytes([1u8; 32]);
        assert!(!PairingError::AlreadyPartnered(user_id).is_retriable());
        assert!(!PairingError::SelfPairing.is_retriable());
        assert!(!PairingError::InvalidOrExpiredCode.is_retriable());
        assert!(!PairingError::NotConnected.is_retriable());
    }

    #[test]
    fn transient_errors_retriable() {
        assert!(PairingError::NetworkUnavailable("dns".into()).is_retriable());
        assert!(PairingError::OperationTimedOut.is_retriable());
        assert!(PairingError::BackendTransientFailure("503".into()).is_retriable());
    }

    #[test]
    fn permission_denied_never_retried() {
        let err = PairingError::PermissionDenied("rules".into());
        assert!(err.is_permission_denied());
        assert!(!err.is_retriable());
    }

    #[test]
    fn user_messages_hide_backend_detail() {
        let err = PairingError::BackendTransientFailure("rocksdb: IO error /var/db".into());
        assert!(!err.user_message().contains("rocksdb"));

        let err = PairingError::NetworkUnavailable("ECONNREFUSED 10.0.0.1".into());
        assert!(!err.user_message().contains("ECONNREFUSED"));
    }
}
