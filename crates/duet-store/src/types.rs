//! Domain types stored in the database.
//!
//! These types represent the persisted state of user accounts, their invite
//! code inventories, and partner requests.

use chrono::{DateTime, Duration, Utc};
use duet_core::{RequestId, UserId};
use serde::{Deserialize, Serialize};

/// A user document stored in the database.
///
/// The partnership relation is symmetric: if this record's `partner_id`
/// points at another user, that user's document points back. Every write
/// that changes `partner_id` on one side must change the other side in the
/// same atomic batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Unique identifier for the user.
    pub user_id: UserId,
    /// Human-readable display name.
    pub display_name: String,
    /// Account email address.
    pub email: String,
    /// The current partner, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<UserId>,
    /// Cached display name of the current partner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_display_name: Option<String>,
    /// Invite codes issued by this user, newest last.
    #[serde(default)]
    pub invite_codes: Vec<InviteCode>,
    /// Incoming partner request IDs awaiting a decision.
    #[serde(default)]
    pub pending_requests: Vec<RequestId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// Create a fresh user document with no partner, codes, or requests.
    #[must_use]
    pub fn new(user_id: UserId, display_name: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            display_name: display_name.into(),
            email: email.into(),
            partner_id: None,
            partner_display_name: None,
            invite_codes: Vec::new(),
            pending_requests: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the user currently has a partner.
    #[must_use]
    pub const fn is_partnered(&self) -> bool {
        self.partner_id.is_some()
    }
}

/// Link two user documents as mutual partners, caching display names.
///
/// Callers must persist both documents in the same atomic batch.
pub fn link_partners(a: &mut UserRecord, b: &mut UserRecord, now: DateTime<Utc>) {
    a.partner_id = Some(b.user_id);
    a.partner_display_name = Some(b.display_name.clone());
    a.updated_at = now;
    b.partner_id = Some(a.user_id);
    b.partner_display_name = Some(a.display_name.clone());
    b.updated_at = now;
}

/// Sever the partnership on both user documents.
///
/// Callers must persist both documents in the same atomic batch.
pub fn unlink_partners(a: &mut UserRecord, b: &mut UserRecord, now: DateTime<Utc>) {
    a.partner_id = None;
    a.partner_display_name = None;
    a.updated_at = now;
    b.partner_id = None;
    b.partner_display_name = None;
    b.updated_at = now;
}

/// A single-use, time-boxed invite code entry.
///
/// Codes live inside the issuer's user document. Expired and used entries
/// are filtered out lazily on the next generation rather than actively
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteCode {
    /// The 6-character uppercase alphanumeric code value.
    pub code: String,
    /// The user who issued the code.
    pub created_by: UserId,
    /// When the code was issued.
    pub created_at: DateTime<Utc>,
    /// When the code stops being redeemable.
    pub expires_at: DateTime<Utc>,
    /// Whether the code has been redeemed.
    pub used: bool,
    /// Who redeemed the code, once used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by: Option<UserId>,
    /// When the code was redeemed, once used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
}

impl InviteCode {
    /// Check whether the code has expired, allowing a grace buffer to
    /// absorb clock skew between the issuing and redeeming clients.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now > self.expires_at + grace
    }

    /// Check whether the code can still be redeemed.
    #[must_use]
    pub fn is_redeemable(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        !self.used && !self.is_expired(now, grace)
    }
}

/// A partner request record stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerRequest {
    /// Unique identifier for the request.
    pub request_id: RequestId,
    /// The user who sent the request.
    pub sender_id: UserId,
    /// Cached display name of the sender, for recipient-side rendering.
    pub sender_name: String,
    /// The user the request targets.
    pub recipient_id: UserId,
    /// Current request status.
    pub status: RequestStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When the request stops being acceptable.
    pub expires_at: DateTime<Utc>,
}

impl PartnerRequest {
    /// Check whether the request has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Status of a partner request.
///
/// `Accepted` and `Declined` are terminal. Expired-but-still-pending
/// requests are filtered at read time, never physically purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RequestStatus {
    /// Awaiting the recipient's decision.
    Pending = 1,
    /// The recipient accepted; the pairing was committed.
    Accepted = 2,
    /// The recipient declined.
    Declined = 3,
}

impl RequestStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `RequestStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Accepted),
            3 => Some(Self::Declined),
            _ => None,
        }
    }
}
