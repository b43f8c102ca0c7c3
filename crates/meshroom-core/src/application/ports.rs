//! Port traits (interfaces) that use cases depend on.
//!
//! Adapters implement these traits; use cases never reference Quinn or the
//! loopback hub directly.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::domain::frame::RoomFrame;
use crate::domain::identity::PeerIdentity;
use crate::domain::member::{ChatMessage, RoomMember};
use crate::domain::session::SessionState;
use crate::error::{SessionError, TransportError};

// ---------------------------------------------------------------------------
// Peer transport (signaling + point-to-point channels)
// ---------------------------------------------------------------------------

/// Transport-unique id of one channel. Lets the session tell a live channel
/// apart from a replaced one to the same remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// One open, ordered, bidirectional channel to a remote identity.
pub trait ChannelHandle: Send + Sync + fmt::Debug {
    fn link_id(&self) -> LinkId;

    fn remote(&self) -> &PeerIdentity;

    /// Enqueue `payload` for delivery. Never blocks.
    fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Close the channel. The remote side observes `LinkEvent::Closed`; the
    /// local side does not. Idempotent.
    fn close(&self);
}

/// Everything a transport reports asynchronously, funneled into a single
/// per-transport queue.
#[derive(Debug)]
pub enum LinkEvent {
    /// A remote peer dialed our identity.
    Incoming(Arc<dyn ChannelHandle>),
    Data {
        remote: PeerIdentity,
        link: LinkId,
        payload: Bytes,
    },
    Closed {
        remote: PeerIdentity,
        link: LinkId,
    },
    Error {
        remote: PeerIdentity,
        link: LinkId,
        error: TransportError,
    },
    /// The registration link to the signaling layer dropped. Open channels
    /// are unaffected.
    SignalingLost,
}

/// Receiving half of a transport's event queue.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// The external peer-transport capability: identity registration with a
/// signaling layer plus direct channels between registered identities.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Register `requested` (or let the layer pick one when `None`).
    async fn register(
        &self,
        requested: Option<PeerIdentity>,
    ) -> Result<PeerIdentity, TransportError>;

    /// Open a channel to `remote`. Returns once the channel is usable.
    async fn dial(&self, remote: &PeerIdentity) -> Result<Arc<dyn ChannelHandle>, TransportError>;

    /// Best-effort re-establishment of the signaling link; open channels are
    /// left alone.
    async fn reconnect_signaling(&self) -> Result<(), TransportError>;

    fn signaling_connected(&self) -> bool;

    /// Release the registered identity and close every channel. Idempotent.
    async fn teardown(&self);
}

/// Builds a fresh transport (and its event queue) for each session attempt.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(
        &self,
        config: &SessionConfig,
    ) -> Result<(Arc<dyn PeerTransport>, LinkEvents), TransportError>;
}

// ---------------------------------------------------------------------------
// FrameCodec (serialization)
// ---------------------------------------------------------------------------

/// Encodes / decodes room frames to/from bytes (e.g. CBOR).
pub trait FrameCodec: Send + Sync {
    fn encode(&self, frame: &RoomFrame) -> anyhow::Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> anyhow::Result<RoomFrame>;
}

// ---------------------------------------------------------------------------
// Membership (in-memory member tracking)
// ---------------------------------------------------------------------------

/// The local view of who is in the room.
pub trait Membership: Send + Sync {
    fn members(&self) -> Vec<RoomMember>;
    fn get(&self, id: &PeerIdentity) -> Option<RoomMember>;
    /// Insert or overwrite; returns the previous entry.
    fn upsert(&self, member: RoomMember) -> Option<RoomMember>;
    /// Insert only when `member.id` is unknown; returns whether it was added.
    fn insert_if_absent(&self, member: RoomMember) -> bool;
    fn remove(&self, id: &PeerIdentity) -> Option<RoomMember>;
    fn clear(&self);
}

// ---------------------------------------------------------------------------
// Room events (UI bridge)
// ---------------------------------------------------------------------------

/// Emits events toward the presentation layer.
///
/// Called from the task that drives the room, so implementations must
/// return promptly.
pub trait RoomEvents: Send + Sync {
    fn on_join(&self, peer: &PeerIdentity, display_name: &str);
    fn on_leave(&self, peer: &PeerIdentity);
    fn on_message(&self, message: &ChatMessage, from: &PeerIdentity);
    fn on_error(&self, error: &SessionError);
    fn on_state_change(&self, state: SessionState);
}
