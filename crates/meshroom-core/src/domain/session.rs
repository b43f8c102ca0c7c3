//! Session lifecycle values.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which side of a room this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Owns the room's fixed identity and waits for inbound channels.
    Host,
    /// Uses an ephemeral identity and dials the host.
    Joiner,
}

impl Role {
    /// Diagnostic shown when establishment times out.
    pub fn timeout_hint(self) -> &'static str {
        match self {
            Self::Host => "no one joined",
            Self::Joiner => "room not found / host offline / network restricted",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Joiner => f.write_str("joiner"),
        }
    }
}
