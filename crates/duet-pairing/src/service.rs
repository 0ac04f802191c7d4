//! The pairing coordinator exposed to the UI layer.
//!
//! This module provides the `Pairing` trait and `PairingService`
//! implementation composing the invite code and partner request managers,
//! the retry wrapper, and the per-session reconcilers.
//!
//! Both pairing paths (code redemption and request acceptance) converge on
//! one atomic two-document commit; after it lands, the caller's reconciler
//! is re-initialized and the new partner receives a best-effort
//! notification whose failure never rolls the transition back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use duet_core::{RequestId, UserId};
use duet_presence::PresenceStore;
use duet_store::{unlink_partners, InviteCode, PartnerRequest, Store};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::codes;
use crate::error::{PairingError, Result};
use crate::reconciler::Reconciler;
use crate::requests;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::types::{PairingConfig, PairingEvent, PresencePhase, UserSummary};

/// Capacity of a session's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Per-user event channels, shared between the service and its notifier.
#[derive(Default)]
pub struct EventHub {
    channels: RwLock<HashMap<UserId, broadcast::Sender<PairingEvent>>>,
}

impl EventHub {
    /// Get or create the event channel for a user.
    fn channel(&self, user_id: &UserId) -> broadcast::Sender<PairingEvent> {
        if let Some(tx) = self.channels.read().get(user_id) {
            return tx.clone();
        }
        self.channels
            .write()
            .entry(*user_id)
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Deliver an event to a user's channel. Returns false when nobody is
    /// listening.
    fn deliver(&self, user_id: &UserId, event: PairingEvent) -> bool {
        self.channels
            .read()
            .get(user_id)
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

/// Best-effort delivery of informational events to another user.
///
/// This is the collaborator seam for the hosting application's push
/// transport. Failures are logged by the caller and never affect the
/// pairing transition that triggered them.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an event to the recipient.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed; callers swallow it after
    /// logging.
    async fn notify(&self, recipient: &UserId, event: PairingEvent) -> Result<()>;
}

/// Default notifier delivering into the recipient's session event channel.
pub struct EventNotifier {
    hub: Arc<EventHub>,
}

#[async_trait]
impl Notifier for EventNotifier {
    async fn notify(&self, recipient: &UserId, event: PairingEvent) -> Result<()> {
        if !self.hub.deliver(recipient, event) {
            debug!(recipient = %recipient, "No live session, notification dropped");
        }
        Ok(())
    }
}

/// Reactive handles returned when a user session attaches.
pub struct SessionHandle {
    /// Pairing events for the UI: new partner, partner departed, incoming
    /// requests, partner presence changes.
    pub events: broadcast::Receiver<PairingEvent>,
    /// The session's connectivity phase.
    pub phase: watch::Receiver<PresencePhase>,
}

/// Trait defining the pairing operations exposed to the UI layer.
#[async_trait]
pub trait Pairing: Send + Sync {
    /// Generate a fresh invite code for the caller.
    async fn generate_invite_code(&self, user_id: &UserId) -> Result<InviteCode>;

    /// The caller's currently redeemable code, if any.
    async fn active_invite_code(&self, user_id: &UserId) -> Result<Option<InviteCode>>;

    /// Redeem an invite code, forming a partnership with its issuer.
    async fn connect_with_code(&self, user_id: &UserId, code: &str) -> Result<UserSummary>;

    /// Sever the caller's partnership.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when the caller has no partner; no state is
    /// mutated in that case.
    async fn disconnect_partner(&self, user_id: &UserId) -> Result<()>;

    /// Search unpartnered users by display name or email.
    async fn search_users(&self, user_id: &UserId, term: &str) -> Result<Vec<UserSummary>>;

    /// Send a partner request to another user.
    async fn send_partner_request(
        &self,
        sender_id: &UserId,
        recipient_id: &UserId,
    ) -> Result<PartnerRequest>;

    /// Accept an incoming partner request, forming the partnership.
    async fn accept_partner_request(
        &self,
        user_id: &UserId,
        request_id: &RequestId,
    ) -> Result<UserSummary>;

    /// Decline an incoming partner request. Idempotent.
    async fn decline_partner_request(&self, user_id: &UserId, request_id: &RequestId)
        -> Result<()>;

    /// The caller's currently valid incoming requests.
    async fn pending_requests(&self, user_id: &UserId) -> Result<Vec<PartnerRequest>>;

    /// The caller's current partner, if any.
    async fn partner_of(&self, user_id: &UserId) -> Result<Option<UserSummary>>;
}

/// The main pairing service implementation.
pub struct PairingService<S: Store, N: Notifier = EventNotifier> {
    store: Arc<S>,
    presence: Arc<PresenceStore>,
    config: PairingConfig,
    notifier: N,
    hub: Arc<EventHub>,
    sessions: RwLock<HashMap<UserId, Arc<Reconciler<S>>>>,
}

impl<S: Store + 'static> PairingService<S, EventNotifier> {
    /// Create a service with the default in-process notifier.
    #[must_use]
    pub fn new(store: Arc<S>, presence: Arc<PresenceStore>, config: PairingConfig) -> Self {
        let hub = Arc::new(EventHub::default());
        let notifier = EventNotifier {
            hub: Arc::clone(&hub),
        };
        Self {
            store,
            presence,
            config,
            notifier,
            hub,
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: Store + 'static, N: Notifier> PairingService<S, N> {
    /// Create a service with a custom notifier.
    #[must_use]
    pub fn with_notifier(
        store: Arc<S>,
        presence: Arc<PresenceStore>,
        config: PairingConfig,
        notifier: N,
    ) -> Self {
        Self {
            store,
            presence,
            config,
            notifier,
            hub: Arc::new(EventHub::default()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &PairingConfig {
        &self.config
    }

    /// Attach a live session for a user, starting its reconciler.
    ///
    /// Any previous session for the same user is shut down first, its
    /// hooks cancelled, so stale state cannot clobber the new session.
    ///
    /// # Errors
    ///
    /// Returns `NotLoggedIn` if the user has no document.
    pub async fn attach(&self, user_id: &UserId) -> Result<SessionHandle> {
        self.store
            .get_user(user_id)?
            .ok_or(PairingError::NotLoggedIn)?;

        let previous = self.sessions.write().remove(user_id);
        if let Some(previous) = previous {
            previous.shutdown();
        }

        let events_tx = self.hub.channel(user_id);
        let reconciler = Reconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.presence),
            self.config.clone(),
            *user_id,
            events_tx.clone(),
        );

        // Subscribe before starting so no event is missed.
        let handle = SessionHandle {
            events: events_tx.subscribe(),
            phase: reconciler.phase(),
        };

        Arc::clone(&reconciler).start().await;
        self.sessions.write().insert(*user_id, reconciler);

        info!(user_id = %user_id, "Session attached");
        Ok(handle)
    }

    /// Detach a user's session, tearing its presence down gracefully.
    pub fn detach(&self, user_id: &UserId) {
        let session = self.sessions.write().remove(user_id);
        if let Some(session) = session {
            session.shutdown();
            info!(user_id = %user_id, "Session detached");
        }
    }

    /// Re-initialize the caller's reconciler after a pairing transition.
    async fn rebind_session(&self, user_id: &UserId) {
        let session = self.sessions.read().get(user_id).cloned();
        if let Some(session) = session {
            session.rebind().await;
        }
    }

    /// Fire a notification, logging and swallowing any failure.
    async fn notify_best_effort(&self, recipient: &UserId, event: PairingEvent) {
        if let Err(err) = self.notifier.notify(recipient, event).await {
            warn!(
                recipient = %recipient,
                error = %err,
                "Notification failed, pairing transition unaffected"
            );
        }
    }
}

#[async_trait]
impl<S: Store + 'static, N: Notifier> Pairing for PairingService<S, N> {
    async fn generate_invite_code(&self, user_id: &UserId) -> Result<InviteCode> {
        let policy = RetryPolicy::backoff(&self.config);
        retry_with_backoff(&policy, || async {
            codes::generate(&*self.store, &self.config, user_id)
        })
        .await
    }

    async fn active_invite_code(&self, user_id: &UserId) -> Result<Option<InviteCode>> {
        codes::active_code(&*self.store, &self.config, user_id)
    }

    async fn connect_with_code(&self, user_id: &UserId, code: &str) -> Result<UserSummary> {
        let policy = RetryPolicy::backoff(&self.config);
        let outcome = retry_with_backoff(&policy, || async {
            codes::redeem(&*self.store, &self.config, code, user_id)
        })
        .await?;

        self.rebind_session(user_id).await;

        let partner = UserSummary::from(&outcome.partner);
        self.notify_best_effort(
            &partner.user_id,
            PairingEvent::Paired {
                partner_id: *user_id,
                partner_name: outcome.user.display_name.clone(),
            },
        )
        .await;

        Ok(partner)
    }

    async fn disconnect_partner(&self, user_id: &UserId) -> Result<()> {
        let policy = RetryPolicy::backoff(&self.config);

        // The durable nulling of both documents is the success criterion.
        let (partner_id, own_name) = retry_with_backoff(&policy, || async {
            let mut me = self
                .store
                .get_user(user_id)?
                .ok_or(PairingError::NotLoggedIn)?;
            let Some(partner_id) = me.partner_id else {
                return Err(PairingError::NotConnected);
            };
            let own_name = me.display_name.clone();
            let now = Utc::now();

            match self.store.get_user(&partner_id)? {
                Some(mut partner) if partner.partner_id == Some(*user_id) => {
                    unlink_partners(&mut me, &mut partner, now);
                    self.store.put_user_pair(&me, &partner)?;
                }
                _ => {
                    // Partner document gone or already pointing elsewhere:
                    // null our side only.
                    me.partner_id = None;
                    me.partner_display_name = None;
                    me.updated_at = now;
                    self.store.put_user(&me)?;
                }
            }
            Ok((partner_id, own_name))
        })
        .await?;

        // Ephemeral cleanup and the notification are best-effort and run
        // concurrently; the reconciler corrects any miss on its next tick.
        let cleanup = async {
            self.presence.remove_connection(user_id);
            self.presence.remove_connection(&partner_id);
            self.presence.mark_offline(&partner_id);
        };
        let notify = self.notify_best_effort(
            &partner_id,
            PairingEvent::PartnerDisconnected {
                partner_name: own_name,
            },
        );
        tokio::join!(cleanup, notify);

        // Force-clear listeners and reset local pairing state.
        self.rebind_session(user_id).await;

        info!(user_id = %user_id, partner = %partner_id, "Partnership disconnected");
        Ok(())
    }

    async fn search_users(&self, user_id: &UserId, term: &str) -> Result<Vec<UserSummary>> {
        requests::search(&*self.store, &self.config, term, user_id)
    }

    async fn send_partner_request(
        &self,
        sender_id: &UserId,
        recipient_id: &UserId,
    ) -> Result<PartnerRequest> {
        let policy = RetryPolicy::backoff(&self.config);
        let request = retry_with_backoff(&policy, || async {
            requests::send(&*self.store, &self.config, sender_id, recipient_id)
        })
        .await?;

        self.notify_best_effort(
            recipient_id,
            PairingEvent::RequestReceived {
                request_id: request.request_id,
                sender_name: request.sender_name.clone(),
            },
        )
        .await;

        Ok(request)
    }

    async fn accept_partner_request(
        &self,
        user_id: &UserId,
        request_id: &RequestId,
    ) -> Result<UserSummary> {
        let policy = RetryPolicy::backoff(&self.config);
        let outcome = retry_with_backoff(&policy, || async {
            requests::accept(&*self.store, request_id, user_id)
        })
        .await?;

        self.rebind_session(user_id).await;

        let partner = UserSummary::from(&outcome.partner);
        self.notify_best_effort(
            &partner.user_id,
            PairingEvent::Paired {
                partner_id: *user_id,
                partner_name: outcome.user.display_name.clone(),
            },
        )
        .await;

        Ok(partner)
    }

    async fn decline_partner_request(
        &self,
        user_id: &UserId,
        request_id: &RequestId,
    ) -> Result<()> {
        let policy = RetryPolicy::backoff(&self.config);
        retry_with_backoff(&policy, || async {
            requests::decline(&*self.store, request_id, user_id)
        })
        .await
    }

    async fn pending_requests(&self, user_id: &UserId) -> Result<Vec<PartnerRequest>> {
        requests::pending(&*self.store, user_id)
    }

    async fn partner_of(&self, user_id: &UserId) -> Result<Option<UserSummary>> {
        let user = self
            .store
            .get_user(user_id)?
            .ok_or(PairingError::NotLoggedIn)?;

        let Some(partner_id) = user.partner_id else {
            return Ok(None);
        };

        let summary = match self.store.get_user(&partner_id)? {
            Some(partner) => UserSummary::from(&partner),
            // Fall back to the cached name if the partner document is gone
            None => UserSummary {
                user_id: partner_id,
                display_name: user
                    .partner_display_name
                    .unwrap_or_else(|| partner_id.to_string()),
                email: String::new(),
            },
        };
        Ok(Some(summary))
    }
}
