//! Partner pairing and presence coordination for duet.
//!
//! This crate is the engine behind the two-person journaling application's
//! "connect with your partner" surface. It owns the one subsystem with real
//! invariants: forming an exclusive two-party partnership (via single-use
//! invite codes or targeted requests), tracking each user's live session
//! against a flaky client, and reconciling transient connection blips
//! against genuine partner departure — while guaranteeing the two durable
//! user documents never disagree about who is partnered with whom.
//!
//! # Modules
//!
//! - [`codes`]: invite code issuance and redemption
//! - [`requests`]: search, send, accept, decline of partner requests
//! - [`reconciler`]: per-session presence tracking and the disconnect
//!   confirmation protocol
//! - [`service`]: the coordinator trait exposed to the UI layer
//! - [`retry`]: backoff wrappers for fallible operations
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use duet_core::UserId;
//! use duet_pairing::{Pairing, PairingConfig, PairingService};
//! use duet_presence::PresenceStore;
//! use duet_store::RocksStore;
//!
//! # async fn demo() -> duet_pairing::Result<()> {
//! let store = Arc::new(RocksStore::open("/tmp/duet-db").unwrap());
//! let presence = Arc::new(PresenceStore::new());
//! let service = PairingService::new(store, presence, PairingConfig::default());
//!
//! let alice = UserId::from_bytes([1u8; 32]);
//! let code = service.generate_invite_code(&alice).await?;
//! println!("share this code: {}", code.code);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod codes;
pub mod error;
pub mod reconciler;
pub mod requests;
pub mod retry;
pub mod service;
pub mod types;

pub use error::{PairingError, Result};
pub use reconciler::Reconciler;
pub use retry::{retry_transient, retry_with_backoff, RetryPolicy};
pub use service::{EventHub, EventNotifier, Notifier, Pairing, PairingService, SessionHandle};
pub use types::{PairOutcome, PairingConfig, PairingEvent, PresencePhase, UserSummary};
