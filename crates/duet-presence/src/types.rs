//! Ephemeral record types held by the presence store.
//!
//! Nothing in this module is durable. Connection records are recreated
//! every session and removed when the session's connection drops; presence
//! records survive disconnects with their online flag flipped false.

use chrono::{DateTime, Utc};
use duet_core::{ConnectionId, UserId};
use serde::{Deserialize, Serialize};

/// Liveness state recorded on a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// The session is live.
    Online,
    /// The session is tearing down.
    Offline,
}

/// Per-session liveness marker for a user.
///
/// Created when a live session starts and removed automatically (via the
/// registered disconnect hook) if the connection drops without explicit
/// teardown. The partner subscribes to this record read-only; its
/// disappearance is the partner-disconnect signal the reconciler
/// double-checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// The user this session belongs to.
    pub user_id: UserId,
    /// The user's partner at the time the record was written, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<UserId>,
    /// Last activity timestamp.
    pub last_active: DateTime<Utc>,
    /// Liveness state.
    pub status: ConnectionStatus,
    /// Token for this session, used to disambiguate overlapping sessions.
    pub connection_id: ConnectionId,
}

/// Online/offline marker for a user.
///
/// Unlike [`ConnectionRecord`], this is never deleted on disconnect — only
/// its `is_online` flag is flipped false, preserving a last-seen timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Whether the user currently has a live session.
    pub is_online: bool,
    /// When the user was last seen online.
    pub last_online: DateTime<Utc>,
    /// Token of the session that last wrote this record.
    pub connection_id: ConnectionId,
}

/// A write registered in advance, applied automatically if the registering
/// session's connection is lost without explicit cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectHook {
    /// Delete the user's connection record.
    RemoveConnection(UserId),
    /// Flip the user's presence record offline, stamping `last_online`.
    MarkOffline(UserId),
}
