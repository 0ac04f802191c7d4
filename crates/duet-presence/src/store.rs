//! In-memory presence store with live subscriptions and disconnect leases.
//!
//! This module provides the `PresenceStore`: a realtime key-value store for
//! connection and presence records. Readers subscribe through
//! `tokio::sync::watch` channels, which deliver the current value
//! immediately and every subsequent change; dropping the receiver cancels
//! the subscription.
//!
//! The hosted-backend "on-disconnect hook" is emulated with leases: a
//! session registers its hooks together with a lease keyed by its
//! connection token and heartbeats it while alive. A graceful teardown
//! releases the lease (hooks cancelled); an abrupt drop, or a lease whose
//! heartbeat goes stale past the TTL, has its hooks applied by the sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use duet_core::{ConnectionId, UserId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{PresenceError, Result};
use crate::types::{ConnectionRecord, DisconnectHook, PresenceRecord};

/// A session lease backing the on-disconnect hooks.
struct Lease {
    user_id: UserId,
    last_heartbeat: Instant,
    hooks: Vec<DisconnectHook>,
}

/// The ephemeral presence store.
///
/// Records are single-writer (only the owning user's session writes its
/// own), read-many (the partner subscribes read-only). Absence of a record
/// is a first-class state: every read returns an `Option`.
#[derive(Default)]
pub struct PresenceStore {
    connections: RwLock<HashMap<UserId, watch::Sender<Option<ConnectionRecord>>>>,
    presence: RwLock<HashMap<UserId, watch::Sender<Option<PresenceRecord>>>>,
    leases: Mutex<HashMap<ConnectionId, Lease>>,
}

impl PresenceStore {
    /// Create a new empty presence store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the watch channel for a user's connection record.
    fn connection_channel(&self, user_id: &UserId) -> watch::Sender<Option<ConnectionRecord>> {
        if let Some(tx) = self.connections.read().get(user_id) {
            return tx.clone();
        }
        self.connections
            .write()
            .entry(*user_id)
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    /// Get or create the watch channel for a user's presence record.
    fn presence_channel(&self, user_id: &UserId) -> watch::Sender<Option<PresenceRecord>> {
        if let Some(tx) = self.presence.read().get(user_id) {
            return tx.clone();
        }
        self.presence
            .write()
            .entry(*user_id)
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    // =========================================================================
    // Connection Records
    // =========================================================================

    /// Write a user's connection record, notifying subscribers.
    pub fn put_connection(&self, record: ConnectionRecord) {
        let tx = self.connection_channel(&record.user_id);
        tx.send_replace(Some(record));
    }

    /// Read a user's connection record, if present.
    #[must_use]
    pub fn get_connection(&self, user_id: &UserId) -> Option<ConnectionRecord> {
        self.connections
            .read()
            .get(user_id)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Remove a user's connection record, notifying subscribers.
    pub fn remove_connection(&self, user_id: &UserId) {
        let tx = self.connection_channel(user_id);
        tx.send_replace(None);
    }

    /// Subscribe to a user's connection record.
    ///
    /// The receiver sees the current value immediately and is notified on
    /// every change. Dropping the receiver is the cancellation.
    #[must_use]
    pub fn watch_connection(&self, user_id: &UserId) -> watch::Receiver<Option<ConnectionRecord>> {
        self.connection_channel(user_id).subscribe()
    }

    // =========================================================================
    // Presence Records
    // =========================================================================

    /// Write a user's presence record, notifying subscribers.
    pub fn put_presence(&self, user_id: &UserId, record: PresenceRecord) {
        let tx = self.presence_channel(user_id);
        tx.send_replace(Some(record));
    }

    /// Read a user's presence record, if present.
    #[must_use]
    pub fn get_presence(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.presence
            .read()
            .get(user_id)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Flip a user's presence record offline, stamping the last-seen time.
    ///
    /// The record itself is preserved; only the flag and timestamp change.
    /// No-op when the user has no presence record yet.
    pub fn mark_offline(&self, user_id: &UserId) {
        let tx = self.presence_channel(user_id);
        tx.send_if_modified(|current| {
            if let Some(record) = current.as_mut() {
                if record.is_online {
                    record.is_online = false;
                    record.last_online = Utc::now();
                    return true;
                }
            }
            false
        });
    }

    /// Subscribe to a user's presence record.
    #[must_use]
    pub fn watch_presence(&self, user_id: &UserId) -> watch::Receiver<Option<PresenceRecord>> {
        self.presence_channel(user_id).subscribe()
    }

    // =========================================================================
    // Leases & Disconnect Hooks
    // =========================================================================

    /// Register a session lease with its on-disconnect hooks.
    ///
    /// The hooks are applied if the lease is dropped abruptly or its
    /// heartbeat goes stale; a graceful [`release_lease`](Self::release_lease)
    /// cancels them unapplied.
    pub fn register_lease(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        hooks: Vec<DisconnectHook>,
    ) {
        let lease = Lease {
            user_id,
            last_heartbeat: Instant::now(),
            hooks,
        };
        self.leases.lock().insert(connection_id, lease);
    }

    /// Refresh a lease's heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `PresenceError::LeaseNotFound` if no lease is registered for
    /// the connection token.
    pub fn heartbeat(&self, connection_id: ConnectionId) -> Result<()> {
        let mut leases = self.leases.lock();
        let lease = leases
            .get_mut(&connection_id)
            .ok_or(PresenceError::LeaseNotFound(connection_id))?;
        lease.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Release a lease gracefully: pending hooks are cancelled, not applied.
    ///
    /// Used on explicit teardown, so a stale hook cannot fire after a newer
    /// session has already written fresh state.
    pub fn release_lease(&self, connection_id: ConnectionId) {
        if self.leases.lock().remove(&connection_id).is_some() {
            debug!(%connection_id, "Released lease, hooks cancelled");
        }
    }

    /// Drop a lease abruptly, applying its hooks immediately.
    ///
    /// This is the programmatic equivalent of the client vanishing.
    pub fn drop_lease(&self, connection_id: ConnectionId) {
        let lease = self.leases.lock().remove(&connection_id);
        if let Some(lease) = lease {
            debug!(%connection_id, user_id = %lease.user_id, "Lease dropped, applying hooks");
            self.apply_hooks(&lease.hooks);
        }
    }

    /// Expire every lease whose heartbeat is older than `ttl`, applying its
    /// hooks. Returns the number of leases expired.
    pub fn expire_stale(&self, ttl: Duration) -> usize {
        let expired: Vec<Lease> = {
            let mut leases = self.leases.lock();
            let stale: Vec<ConnectionId> = leases
                .iter()
                .filter(|(_, lease)| lease.last_heartbeat.elapsed() > ttl)
                .map(|(id, _)| *id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| leases.remove(&id))
                .collect()
        };

        for lease in &expired {
            debug!(user_id = %lease.user_id, "Lease heartbeat stale, applying hooks");
            self.apply_hooks(&lease.hooks);
        }

        expired.len()
    }

    /// Spawn the background sweeper that expires stale leases periodically.
    ///
    /// Abort the returned handle to stop the sweeper.
    #[must_use]
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = store.expire_stale(ttl);
                if expired > 0 {
                    debug!(expired, "Sweeper expired stale leases");
                }
            }
        })
    }

    /// Apply a set of disconnect hooks.
    fn apply_hooks(&self, hooks: &[DisconnectHook]) {
        for hook in hooks {
            match hook {
                DisconnectHook::RemoveConnection(user_id) => self.remove_connection(user_id),
                DisconnectHook::MarkOffline(user_id) => self.mark_offline(user_id),
            }
        }
    }
}
