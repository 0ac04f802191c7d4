//! Presence tracking and disconnect reconciliation.
//!
//! Each attached session runs one `Reconciler`. It establishes the
//! session's ephemeral records (with on-disconnect hooks registered first,
//! so an abrupt drop always cleans up), watches the partner's liveness, and
//! decides whether an apparent partner drop is genuine before touching
//! durable state.
//!
//! # State machine
//!
//! ```text
//!   Checking ──────▶ Connected ◀────▶ Disconnected
//!      │                 │
//!      └──── (retries ───┴──▶ Unknown
//!            exhausted)
//! ```
//!
//! The phase is published through a watch channel for the UI to observe.
//!
//! # Disconnect confirmation
//!
//! A partner's connection record vanishing is only a signal. The record may
//! have been removed by an in-flight, intentional pairing change rather
//! than a real drop, so the reconciler re-reads the partner's durable user
//! document and tears the partnership down only when that fresh read shows
//! the partner holds no partner (or no longer exists).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use duet_core::{ConnectionId, UserId};
use duet_presence::{
    ConnectionRecord, ConnectionStatus, DisconnectHook, PresenceRecord, PresenceStore,
};
use duet_store::{unlink_partners, Store};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PairingError, Result};
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{PairingConfig, PairingEvent, PresencePhase};

/// Check if a phase transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: PresencePhase, to: PresencePhase) -> bool {
    use PresencePhase::{Checking, Connected, Disconnected, Unknown};

    matches!(
        (from, to),
        // Setup resolves to Connected, or degrades to Unknown; shutdown can
        // interrupt it
        (Checking, Connected | Disconnected | Unknown)
            // A live session can re-check (rebind) or tear down
            | (Connected, Checking | Disconnected)
            // A torn-down or degraded session can start over
            | (Disconnected | Unknown, Checking)
            // A degraded session can still shut down cleanly
            | (Unknown, Disconnected)
    )
}

/// Per-session presence coordinator.
pub struct Reconciler<S> {
    store: Arc<S>,
    presence: Arc<PresenceStore>,
    config: PairingConfig,
    user_id: UserId,
    events: broadcast::Sender<PairingEvent>,
    phase_tx: watch::Sender<PresencePhase>,
    inner: Mutex<Inner>,
}

/// Live handles owned by the current setup round.
struct Inner {
    connection_id: Option<ConnectionId>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: Store + 'static> Reconciler<S> {
    /// Create a reconciler for one user session.
    ///
    /// Events are delivered through the given broadcast channel; the phase
    /// is observable via [`phase`](Self::phase).
    #[must_use]
    pub fn new(
        store: Arc<S>,
        presence: Arc<PresenceStore>,
        config: PairingConfig,
        user_id: UserId,
        events: broadcast::Sender<PairingEvent>,
    ) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(PresencePhase::Checking);
        Arc::new(Self {
            store,
            presence,
            config,
            user_id,
            events,
            phase_tx,
            inner: Mutex::new(Inner {
                connection_id: None,
                tasks: Vec::new(),
            }),
        })
    }

    /// Subscribe to the session's connectivity phase.
    #[must_use]
    pub fn phase(&self) -> watch::Receiver<PresencePhase> {
        self.phase_tx.subscribe()
    }

    /// The current session connection token, if established.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.lock().connection_id
    }

    /// Transition the published phase.
    fn set_phase(&self, to: PresencePhase) {
        let from = *self.phase_tx.borrow();
        if from == to {
            return;
        }
        debug_assert!(is_valid_transition(from, to), "{from:?} -> {to:?}");
        self.phase_tx.send_replace(to);
    }

    /// Run presence setup, retrying transient failures with a fixed delay.
    ///
    /// Exhausting the attempt cap leaves the session in the degraded
    /// `Unknown` phase rather than failing the caller.
    pub async fn start(self: Arc<Self>) {
        self.set_phase(PresencePhase::Checking);

        let policy = RetryPolicy::presence(&self.config);
        let result = retry_transient(&policy, || {
            let this = Arc::clone(&self);
            async move { Self::establish(&this) }
        })
        .await;

        match result {
            Ok(()) => self.set_phase(PresencePhase::Connected),
            Err(err) => {
                warn!(
                    user_id = %self.user_id,
                    error = %err,
                    "Presence setup failed, degrading to unknown"
                );
                self.set_phase(PresencePhase::Unknown);
            }
        }
    }

    /// Re-run setup from scratch against current durable state.
    ///
    /// Called after every pairing transition so the watchers track the new
    /// partner (or stop tracking a departed one).
    pub async fn rebind(self: Arc<Self>) {
        self.start().await;
    }

    /// Graceful teardown: watchers aborted, pending hooks cancelled, the
    /// connection record proactively removed, presence flipped offline.
    pub fn shutdown(&self) {
        self.teardown_local(true);
        self.set_phase(PresencePhase::Disconnected);
        info!(user_id = %self.user_id, "Presence session shut down");
    }

    /// One setup round: hooks first, then records, then watchers.
    fn establish(this: &Arc<Self>) -> Result<()> {
        // Re-entrant: clear any previous round before writing fresh state,
        // cancelling its hooks so they cannot clobber the new records.
        this.teardown_local(false);

        // A failing durable read here is the backend being unreachable, and
        // is retried by the setup policy.
        let user = this
            .store
            .get_user(&this.user_id)
            .map_err(|e| PairingError::BackendTransientFailure(e.to_string()))?
            .ok_or(PairingError::NotLoggedIn)?;

        let now = Utc::now();
        let connection_id = ConnectionId::generate();

        // Hooks before records: if the connection drops mid-setup the store
        // still cleans up.
        this.presence.register_lease(
            connection_id,
            this.user_id,
            vec![
                DisconnectHook::RemoveConnection(this.user_id),
                DisconnectHook::MarkOffline(this.user_id),
            ],
        );

        this.presence.put_connection(ConnectionRecord {
            user_id: this.user_id,
            partner_id: user.partner_id,
            last_active: now,
            status: ConnectionStatus::Online,
            connection_id,
        });
        this.presence.put_presence(
            &this.user_id,
            PresenceRecord {
                is_online: true,
                last_online: now,
                connection_id,
            },
        );

        let mut tasks = vec![Self::spawn_heartbeat(this, connection_id)];
        if let Some(partner_id) = user.partner_id {
            tasks.push(Self::spawn_presence_watcher(this, partner_id));
            tasks.push(Self::spawn_connection_watcher(this, partner_id));
        }

        let mut inner = this.inner.lock();
        inner.connection_id = Some(connection_id);
        inner.tasks = tasks;

        info!(
            user_id = %this.user_id,
            %connection_id,
            partner = ?user.partner_id,
            "Presence established"
        );

        Ok(())
    }

    /// Abort watchers and release the lease of the previous round.
    fn teardown_local(&self, remove_records: bool) {
        let (connection_id, tasks) = {
            let mut inner = self.inner.lock();
            (inner.connection_id.take(), std::mem::take(&mut inner.tasks))
        };

        for task in tasks {
            task.abort();
        }

        if let Some(connection_id) = connection_id {
            self.presence.release_lease(connection_id);
            if remove_records {
                self.presence.remove_connection(&self.user_id);
                self.presence.mark_offline(&self.user_id);
            }
        }
    }

    /// Keep the session lease alive while the session runs.
    fn spawn_heartbeat(this: &Arc<Self>, connection_id: ConnectionId) -> JoinHandle<()> {
        let this = Arc::clone(this);
        let period = Duration::from_secs(this.config.presence_lease_ttl_seconds.max(3) / 3);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if this.presence.heartbeat(connection_id).is_err() {
                    // Lease gone: a newer session owns the records now.
                    debug!(user_id = %this.user_id, %connection_id, "Lease lost, heartbeat stops");
                    break;
                }
            }
        })
    }

    /// Mirror the partner's online/offline flag into the event channel.
    fn spawn_presence_watcher(this: &Arc<Self>, partner_id: UserId) -> JoinHandle<()> {
        let this = Arc::clone(this);
        tokio::spawn(async move {
            let mut rx = this.presence.watch_presence(&partner_id);
            while rx.changed().await.is_ok() {
                let online = rx.borrow().as_ref().is_some_and(|p| p.is_online);
                let _ = this
                    .events
                    .send(PairingEvent::PartnerPresenceChanged { online });
            }
        })
    }

    /// Watch the partner's connection record for disappearance.
    fn spawn_connection_watcher(this: &Arc<Self>, partner_id: UserId) -> JoinHandle<()> {
        let this = Arc::clone(this);
        tokio::spawn(async move {
            let mut rx = this.presence.watch_connection(&partner_id);
            // Only a present-to-absent transition is a disconnect signal;
            // a partner that has not connected yet is not one.
            let mut seen_present = rx.borrow().is_some();

            while rx.changed().await.is_ok() {
                let present = rx.borrow().is_some();
                if present {
                    seen_present = true;
                    continue;
                }
                if !seen_present {
                    continue;
                }
                seen_present = false;

                match this.confirm_partner_disconnect(partner_id) {
                    Ok(true) => {
                        info!(
                            user_id = %this.user_id,
                            partner = %partner_id,
                            "Partner departure confirmed, partnership torn down"
                        );
                        break;
                    }
                    Ok(false) => {
                        debug!(
                            user_id = %this.user_id,
                            partner = %partner_id,
                            "Stale disconnect signal ignored"
                        );
                    }
                    Err(err) => {
                        warn!(
                            user_id = %this.user_id,
                            error = %err,
                            "Could not verify partner disconnect"
                        );
                    }
                }
            }
        })
    }

    /// Double-check an apparent partner drop against the durable store and
    /// tear the partnership down if it is genuine.
    ///
    /// Returns `Ok(true)` when the partnership was torn down, `Ok(false)`
    /// when the signal was stale.
    fn confirm_partner_disconnect(&self, partner_id: UserId) -> Result<bool> {
        let partner = self.store.get_user(&partner_id)?;

        // A partner document that still holds a partner means the record
        // was removed by an in-flight pairing change, not a departure.
        if partner.as_ref().is_some_and(|p| p.partner_id.is_some()) {
            return Ok(false);
        }

        let Some(mut me) = self.store.get_user(&self.user_id)? else {
            return Ok(false);
        };
        if me.partner_id != Some(partner_id) {
            // Already resolved by another path.
            return Ok(false);
        }

        let partner_name = me
            .partner_display_name
            .clone()
            .unwrap_or_else(|| partner_id.to_string());
        let now = Utc::now();

        if let Some(mut partner) = partner {
            unlink_partners(&mut me, &mut partner, now);
            self.store.put_user_pair(&me, &partner)?;
        } else {
            me.partner_id = None;
            me.partner_display_name = None;
            me.updated_at = now;
            self.store.put_user(&me)?;
        }

        // The local connection record still advertises the departed
        // partner; replace it and put presence back online.
        self.presence.remove_connection(&self.user_id);
        if let Some(connection_id) = self.inner.lock().connection_id {
            let now = Utc::now();
            self.presence.put_connection(ConnectionRecord {
                user_id: self.user_id,
                partner_id: None,
                last_active: now,
                status: ConnectionStatus::Online,
                connection_id,
            });
            self.presence.put_presence(
                &self.user_id,
                PresenceRecord {
                    is_online: true,
                    last_online: now,
                    connection_id,
                },
            );
        }

        let _ = self
            .events
            .send(PairingEvent::PartnerDisconnected { partner_name });

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_store::{link_partners, RocksStore, UserRecord};
    use tempfile::TempDir;

    fn setup() -> (Arc<RocksStore>, Arc<PresenceStore>, TempDir, PairingConfig) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let presence = Arc::new(PresenceStore::new());
        (store, presence, dir, PairingConfig::default())
    }

    fn create_user(store: &RocksStore, name: &str) -> UserRecord {
        let user_id = UserId::generate_deterministic(&format!("{name}@example.com"), name, 7);
        let user = UserRecord::new(user_id, name, format!("{name}@example.com"));
        store.put_user(&user).unwrap();
        user
    }

    fn pair_durably(store: &RocksStore, a: &UserRecord, b: &UserRecord) {
        let mut a = store.get_user(&a.user_id).unwrap().unwrap();
        let mut b = store.get_user(&b.user_id).unwrap().unwrap();
        link_partners(&mut a, &mut b, Utc::now());
        store.put_user_pair(&a, &b).unwrap();
    }

    fn reconciler_for(
        store: &Arc<RocksStore>,
        presence: &Arc<PresenceStore>,
        config: &PairingConfig,
        user_id: UserId,
    ) -> (
        Arc<Reconciler<RocksStore>>,
        broadcast::Receiver<PairingEvent>,
    ) {
        let (tx, rx) = broadcast::channel(16);
        let reconciler = Reconciler::new(
            Arc::clone(store),
            Arc::clone(presence),
            config.clone(),
            user_id,
            tx,
        );
        (reconciler, rx)
    }

    #[test]
    fn phase_transitions() {
        use PresencePhase::{Checking, Connected, Disconnected, Unknown};

        assert!(is_valid_transition(Checking, Connected));
        assert!(is_valid_transition(Checking, Unknown));
        assert!(is_valid_transition(Connected, Checking));
        assert!(is_valid_transition(Connected, Disconnected));
        assert!(is_valid_transition(Disconnected, Checking));
        assert!(is_valid_transition(Unknown, Checking));

        // A degraded or torn-down session never becomes live without
        // passing through setup again
        assert!(!is_valid_transition(Unknown, Connected));
        assert!(!is_valid_transition(Disconnected, Connected));
        assert!(!is_valid_transition(Connected, Unknown));
    }

    #[tokio::test]
    async fn start_establishes_records() {
        let (store, presence, _dir, config) = setup();
        let alice = create_user(&store, "alice");

        let (reconciler, _rx) = reconciler_for(&store, &presence, &config, alice.user_id);
        Arc::clone(&reconciler).start().await;

        assert_eq!(*reconciler.phase().borrow(), PresencePhase::Connected);

        let connection = presence.get_connection(&alice.user_id).unwrap();
        assert_eq!(connection.partner_id, None);
        assert_eq!(connection.status, ConnectionStatus::Online);

        let record = presence.get_presence(&alice.user_id).unwrap();
        assert!(record.is_online);
        assert_eq!(record.connection_id, connection.connection_id);
    }

    #[tokio::test]
    async fn start_records_partner_when_paired() {
        let (store, presence, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        pair_durably(&store, &alice, &bob);

        let (reconciler, _rx) = reconciler_for(&store, &presence, &config, alice.user_id);
        Arc::clone(&reconciler).start().await;

        let connection = presence.get_connection(&alice.user_id).unwrap();
        assert_eq!(connection.partner_id, Some(bob.user_id));
    }

    #[tokio::test]
    async fn missing_user_degrades_to_unknown() {
        let (store, presence, _dir, config) = setup();
        let ghost = UserId::from_bytes([9u8; 32]);

        let (reconciler, _rx) = reconciler_for(&store, &presence, &config, ghost);
        Arc::clone(&reconciler).start().await;

        assert_eq!(*reconciler.phase().borrow(), PresencePhase::Unknown);
        assert!(presence.get_connection(&ghost).is_none());
    }

    #[tokio::test]
    async fn genuine_partner_drop_tears_down() {
        let (store, presence, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        pair_durably(&store, &alice, &bob);

        let (reconciler, mut rx) = reconciler_for(&store, &presence, &config, alice.user_id);
        Arc::clone(&reconciler).start().await;

        // Bob comes online, then departs: his side of the partnership is
        // durably severed and his connection record vanishes.
        presence.put_connection(ConnectionRecord {
            user_id: bob.user_id,
            partner_id: Some(alice.user_id),
            last_active: Utc::now(),
            status: ConnectionStatus::Online,
            connection_id: ConnectionId::generate(),
        });
        // Let the watcher observe the record before it vanishes; watch
        // channels coalesce rapid updates.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut stored_bob = store.get_user(&bob.user_id).unwrap().unwrap();
        stored_bob.partner_id = None;
        stored_bob.partner_display_name = None;
        store.put_user(&stored_bob).unwrap();
        presence.remove_connection(&bob.user_id);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reconciler should emit within the timeout")
            .unwrap();
        assert_eq!(
            event,
            PairingEvent::PartnerDisconnected {
                partner_name: "bob".to_string()
            }
        );

        let stored_alice = store.get_user(&alice.user_id).unwrap().unwrap();
        assert!(stored_alice.partner_id.is_none());
        assert!(stored_alice.partner_display_name.is_none());

        // Alice's connection record no longer advertises bob
        let connection = presence.get_connection(&alice.user_id).unwrap();
        assert_eq!(connection.partner_id, None);
        assert!(presence.get_presence(&alice.user_id).unwrap().is_online);
    }

    #[tokio::test]
    async fn stale_signal_preserves_partnership() {
        let (store, presence, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        pair_durably(&store, &alice, &bob);

        let (reconciler, mut rx) = reconciler_for(&store, &presence, &config, alice.user_id);
        Arc::clone(&reconciler).start().await;

        // Bob's connection record blips away while his durable document
        // still shows the partnership (an in-flight reconnect).
        presence.put_connection(ConnectionRecord {
            user_id: bob.user_id,
            partner_id: Some(alice.user_id),
            last_active: Utc::now(),
            status: ConnectionStatus::Online,
            connection_id: ConnectionId::generate(),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        presence.remove_connection(&bob.user_id);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored_alice = store.get_user(&alice.user_id).unwrap().unwrap();
        assert_eq!(stored_alice.partner_id, Some(bob.user_id));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn partner_presence_changes_surface_as_events() {
        let (store, presence, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        pair_durably(&store, &alice, &bob);

        let (reconciler, mut rx) = reconciler_for(&store, &presence, &config, alice.user_id);
        Arc::clone(&reconciler).start().await;

        presence.put_presence(
            &bob.user_id,
            PresenceRecord {
                is_online: true,
                last_online: Utc::now(),
                connection_id: ConnectionId::generate(),
            },
        );

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("presence change should surface")
            .unwrap();
        assert_eq!(event, PairingEvent::PartnerPresenceChanged { online: true });
    }

    #[tokio::test]
    async fn shutdown_cancels_hooks_and_clears_records() {
        let (store, presence, _dir, config) = setup();
        let alice = create_user(&store, "alice");

        let (reconciler, _rx) = reconciler_for(&store, &presence, &config, alice.user_id);
        Arc::clone(&reconciler).start().await;
        assert!(presence.get_connection(&alice.user_id).is_some());

        reconciler.shutdown();

        assert_eq!(*reconciler.phase().borrow(), PresencePhase::Disconnected);
        assert!(presence.get_connection(&alice.user_id).is_none());
        assert!(!presence.get_presence(&alice.user_id).unwrap().is_online);

        // Graceful path released the lease: nothing left for the sweeper
        assert_eq!(presence.expire_stale(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn rebind_tracks_new_partner() {
        let (store, presence, _dir, config) = setup();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        let (reconciler, _rx) = reconciler_for(&store, &presence, &config, alice.user_id);
        Arc::clone(&reconciler).start().await;
        let first = presence
            .get_connection(&alice.user_id)
            .unwrap()
            .connection_id;
        assert_eq!(
            presence.get_connection(&alice.user_id).unwrap().partner_id,
            None
        );

        pair_durably(&store, &alice, &bob);
        Arc::clone(&reconciler).rebind().await;

        let connection = presence.get_connection(&alice.user_id).unwrap();
        assert_eq!(connection.partner_id, Some(bob.user_id));
        // A fresh session token was issued
        assert!(connection.connection_id >= first);
        assert_eq!(*reconciler.phase().borrow(), PresencePhase::Connected);
    }
}
