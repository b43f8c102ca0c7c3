//! meshroom-core: peer-to-peer session management and a small room
//! protocol (membership + chat) on top of it.
//!
//! # Architecture (Clean Architecture)
//!
//! - **domain**: identities, room codes, members, frames (no I/O).
//! - **application**: transport session, resilience controller, room
//!   protocol + port traits.
//! - **adapters**: QUIC (Quinn) transport and signaling server, in-process
//!   loopback transport, CBOR frame codec, in-memory membership.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;

pub use application::room_protocol::{RoomConfig, RoomProtocol};
pub use config::SessionConfig;
pub use error::{ErrorKind, SessionError, TransportError};
