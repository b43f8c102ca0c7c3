//! Room protocol frames.
//!
//! Carried as opaque payloads over a channel; only the room protocol
//! interprets them. Pure data, no I/O.

use serde::{Deserialize, Serialize};

use super::identity::PeerIdentity;
use super::member::{ChatMessage, RoomMember};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomFrame {
    /// `user` is (now) part of the room.
    Join { user: RoomMember },
    /// `user_id` left the room.
    Leave { user_id: PeerIdentity },
    Chat { message: ChatMessage },
    /// Snapshot of the sender's membership view.
    UserList { users: Vec<RoomMember> },
}

impl RoomFrame {
    /// Short name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "JOIN",
            Self::Leave { .. } => "LEAVE",
            Self::Chat { .. } => "CHAT",
            Self::UserList { .. } => "USER_LIST",
        }
    }
}
