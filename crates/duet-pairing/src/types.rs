//! Configuration and view types for the pairing engine.

use chrono::Duration;
use duet_core::{RequestId, UserId};
use duet_store::UserRecord;
use serde::{Deserialize, Serialize};

/// Configuration for the pairing engine.
///
/// One instance is passed explicitly to the service and every per-session
/// reconciler; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// How long a generated invite code stays redeemable (seconds).
    pub code_ttl_seconds: i64,
    /// Grace buffer applied to expiry checks at redemption, absorbing clock
    /// skew between clients (seconds).
    pub code_expiry_grace_seconds: i64,
    /// How long a partner request stays acceptable (seconds).
    pub request_ttl_seconds: i64,
    /// Maximum attempts for retried operations.
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff (milliseconds).
    pub retry_initial_delay_ms: u64,
    /// Fixed delay between presence setup attempts (milliseconds).
    pub presence_retry_delay_ms: u64,
    /// Absolute deadline for a single attempt (milliseconds).
    pub attempt_timeout_ms: u64,
    /// How long a session lease survives without a heartbeat (seconds).
    pub presence_lease_ttl_seconds: u64,
    /// Maximum number of search results returned.
    pub search_limit: usize,
    /// Minimum number of characters in a search term.
    pub min_search_chars: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_ttl_seconds: 600,         // 10 minutes
            code_expiry_grace_seconds: 60, // 1 minute
            request_ttl_seconds: 300,      // 5 minutes
            max_retry_attempts: 3,
            retry_initial_delay_ms: 200,
            presence_retry_delay_ms: 1_000,
            attempt_timeout_ms: 10_000,
            presence_lease_ttl_seconds: 30,
            search_limit: 20,
            min_search_chars: 2,
        }
    }
}

impl PairingConfig {
    /// Invite code time-to-live.
    #[must_use]
    pub fn code_ttl(&self) -> Duration {
        Duration::seconds(self.code_ttl_seconds)
    }

    /// Grace buffer for redemption-side expiry checks.
    #[must_use]
    pub fn code_grace(&self) -> Duration {
        Duration::seconds(self.code_expiry_grace_seconds)
    }

    /// Partner request time-to-live.
    #[must_use]
    pub fn request_ttl(&self) -> Duration {
        Duration::seconds(self.request_ttl_seconds)
    }
}

/// A reduced view of a user, safe to hand to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    /// The user's identifier.
    pub user_id: UserId,
    /// The user's display name.
    pub display_name: String,
    /// The user's email address.
    pub email: String,
}

impl From<&UserRecord> for UserSummary {
    fn from(user: &UserRecord) -> Self {
        Self {
            user_id: user.user_id,
            display_name: user.display_name.clone(),
            email: user.email.clone(),
        }
    }
}

/// The two freshly-committed documents of a pairing transition.
#[derive(Debug, Clone)]
pub struct PairOutcome {
    /// The caller's updated document.
    pub user: UserRecord,
    /// The new partner's updated document.
    pub partner: UserRecord,
}

/// Events surfaced to the UI layer through a session's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A pairing transition committed; the user now has this partner.
    Paired {
        /// The new partner.
        partner_id: UserId,
        /// The new partner's display name.
        partner_name: String,
    },
    /// The partner genuinely departed; the partnership was torn down.
    /// Display once and dismiss.
    PartnerDisconnected {
        /// The departed partner's display name.
        partner_name: String,
    },
    /// A partner request arrived.
    RequestReceived {
        /// The request's identifier.
        request_id: RequestId,
        /// The sender's display name.
        sender_name: String,
    },
    /// The partner's presence record changed.
    PartnerPresenceChanged {
        /// Whether the partner is now online.
        online: bool,
    },
}

/// Connectivity phase of a session, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresencePhase {
    /// Presence setup is in progress.
    #[default]
    Checking,
    /// The session is live and its records are established.
    Connected,
    /// The session has been torn down.
    Disconnected,
    /// Presence setup exhausted its retries; connectivity is unknown.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = PairingConfig::default();
        assert_eq!(config.code_ttl(), Duration::minutes(10));
        assert_eq!(config.code_grace(), Duration::minutes(1));
        assert_eq!(config.request_ttl(), Duration::minutes(5));
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.min_search_chars, 2);
    }

    #[test]
    fn summary_from_record() {
        let user = UserRecord::new(UserId::from_bytes([1u8; 32]), "Alice", "a@example.com");
        let summary = UserSummary::from(&user);
        assert_eq!(summary.display_name, "Alice");
        assert_eq!(summary.email, "a@example.com");
    }
}
