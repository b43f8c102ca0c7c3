//! Room members and chat messages.

use serde::{Deserialize, Serialize};

use super::identity::PeerIdentity;

/// A participant as seen by everyone else in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub id: PeerIdentity,
    pub display_name: String,
}

impl RoomMember {
    pub fn new(id: PeerIdentity, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// One chat line.
///
/// `sequence` is monotonic per sender only; streams from different senders
/// are not ordered relative to each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sequence: u64,
    /// Display name of the sender at the time of sending.
    pub sender: String,
    pub content: String,
    /// Milliseconds since the UNIX epoch, sender's clock.
    pub timestamp_ms: u64,
}
