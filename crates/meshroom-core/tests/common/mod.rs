//! Common test utilities for integration tests.
//!
//! Rooms here run over the in-process loopback hub unless a test says
//! otherwise.

use std::sync::Arc;
use std::time::Duration;

use meshroom_core::adapters::codec::CborFrameCodec;
use meshroom_core::adapters::loopback::LoopbackHub;
use meshroom_core::adapters::membership::InMemoryMembership;
use meshroom_core::adapters::recording::RecordingEvents;
use meshroom_core::application::ports::TransportConnector;
use meshroom_core::domain::identity::{PeerIdentity, RoomCode};
use meshroom_core::{RoomConfig, RoomProtocol, SessionConfig};

/// Default timeout for test operations.
#[allow(dead_code)]
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize test logging with appropriate filters.
///
/// Safe to call multiple times (subsequent calls are no-ops).
#[allow(dead_code)]
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("meshroom_core=debug,quinn=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Run an async operation with a timeout; panics if it doesn't finish.
#[allow(dead_code)]
pub async fn with_timeout<T, F>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("Test operation timed out")
}

/// Config with an empty namespace so host identities equal room codes.
#[allow(dead_code)]
pub fn test_config() -> SessionConfig {
    SessionConfig::default().with_namespace("")
}

#[allow(dead_code)]
pub fn code(raw: &str) -> RoomCode {
    RoomCode::parse(raw).expect("valid room code")
}

/// A room on `connector` plus the recorder receiving its events.
#[allow(dead_code)]
pub fn room_on(
    connector: Arc<dyn TransportConnector>,
    config: SessionConfig,
    room: RoomConfig,
) -> (RoomProtocol, Arc<RecordingEvents>) {
    let events = Arc::new(RecordingEvents::default());
    let protocol = RoomProtocol::new(
        connector,
        config,
        room,
        Arc::new(CborFrameCodec),
        Arc::new(InMemoryMembership::new()),
        events.clone(),
    );
    (protocol, events)
}

#[allow(dead_code)]
pub fn host(hub: &LoopbackHub, room_code: &str, name: &str) -> (RoomProtocol, Arc<RecordingEvents>) {
    room_on(
        Arc::new(hub.connector()),
        test_config(),
        RoomConfig::host(code(room_code), name),
    )
}

#[allow(dead_code)]
pub fn joiner(hub: &LoopbackHub, room_code: &str, name: &str) -> (RoomProtocol, Arc<RecordingEvents>) {
    room_on(
        Arc::new(hub.connector()),
        test_config(),
        RoomConfig::joiner(code(room_code), name),
    )
}

/// Handle queued events on every room until none has anything left.
#[allow(dead_code)]
pub fn settle(rooms: &mut [&mut RoomProtocol]) {
    loop {
        let handled: usize = rooms.iter_mut().map(|r| r.process_pending()).sum();
        if handled == 0 {
            break;
        }
    }
}

#[allow(dead_code)]
pub fn member_ids(room: &RoomProtocol) -> Vec<PeerIdentity> {
    room.members().into_iter().map(|m| m.id).collect()
}
