//! Core types for the duet pairing engine.
//!
//! This crate provides the strongly-typed identifiers used throughout the
//! engine:
//!
//! - **`UserId`**: 32-byte account identifier, hex-encoded for display
//! - **`RequestId`**: UUID identifier for partner requests
//! - **`ConnectionId`**: millisecond token disambiguating live sessions
//!
//! # Example
//!
//! ```
//! use duet_core::{UserId, RequestId, ConnectionId};
//!
//! // Parse a user ID from hex
//! let user_id = UserId::from_hex(
//!     "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
//! ).unwrap();
//!
//! // Generate a request ID
//! let request_id = RequestId::generate();
//!
//! // Generate a connection token for a fresh session
//! let connection_id = ConnectionId::generate();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;

pub use ids::{ConnectionId, IdError, RequestId, UserId};
