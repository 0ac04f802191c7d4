//! Ephemeral presence layer for the duet pairing engine.
//!
//! This crate provides the realtime, non-durable side of the engine: which
//! users currently have a live session, and the machinery for reacting when
//! one of those sessions vanishes.
//!
//! # Architecture
//!
//! - **Connection records**: per-session liveness markers, removed when the
//!   session drops. The partner watches this record; its disappearance is
//!   the disconnect signal.
//! - **Presence records**: online/offline + last-seen markers, flipped but
//!   never deleted on disconnect.
//! - **Leases**: the stand-in for a hosted realtime store's on-disconnect
//!   hook. A session registers hooks with a heartbeaten lease; the sweeper
//!   applies the hooks when the heartbeat goes stale, and a graceful
//!   teardown cancels them.
//!
//! Everything here is reconstructed every session; nothing is durable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod store;
pub mod types;

pub use error::{PresenceError, Result};
pub use store::PresenceStore;
pub use types::{ConnectionRecord, ConnectionStatus, DisconnectHook, PresenceRecord};
