//! Room assembly: wires adapters from meshroom-core into a [`RoomProtocol`].

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use meshroom_core::adapters::codec::CborFrameCodec;
use meshroom_core::adapters::membership::InMemoryMembership;
use meshroom_core::adapters::quic::QuicConnector;
use meshroom_core::application::ports::{FrameCodec, Membership, RoomEvents, TransportConnector};
use meshroom_core::domain::identity::RoomCode;
use meshroom_core::{RoomConfig, RoomProtocol, SessionConfig};

use crate::events::TerminalEvents;

/// Load the session config, falling back to defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(SessionConfig::default()),
    }
}

/// Build every adapter and the room protocol. Nothing touches the network
/// until `join`.
pub fn build_room(
    signaling_addr: SocketAddr,
    config: SessionConfig,
    room: RoomConfig,
) -> RoomProtocol {
    info!(%signaling_addr, room = %room.room_code, role = %room.role, "Building room");

    let connector: Arc<dyn TransportConnector> = Arc::new(QuicConnector::new(signaling_addr));
    let codec: Arc<dyn FrameCodec> = Arc::new(CborFrameCodec);
    let membership: Arc<dyn Membership> = Arc::new(InMemoryMembership::new());
    let events: Arc<dyn RoomEvents> = Arc::new(TerminalEvents);

    RoomProtocol::new(connector, config, room, codec, membership, events)
}

/// Room code for `host`: the one given, or a fresh one.
pub fn host_code(code: Option<&str>) -> anyhow::Result<RoomCode> {
    match code {
        Some(raw) => RoomCode::parse(raw).context("invalid room code"),
        None => Ok(RoomCode::generate()),
    }
}
