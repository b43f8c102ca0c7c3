//! Peer identities and room codes.
//!
//! These are **pure data**: no I/O, no framework dependencies.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix applied to every identity this crate derives, so that our ids do
/// not clash with other tenants of a shared signaling server.
pub const DEFAULT_NAMESPACE: &str = "meshroom-";

/// Length of the random component of an ephemeral identity.
const EPHEMERAL_RANDOM_LEN: usize = 10;

const MAX_ROOM_CODE_LEN: usize = 32;

// ---------------------------------------------------------------------------
// PeerIdentity
// ---------------------------------------------------------------------------

/// Opaque name of a participant within the signaling namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Deterministic identity for the host of `code`.
    ///
    /// Distinct codes always map to distinct identities within one namespace.
    pub fn fixed(namespace: &str, code: &RoomCode) -> Self {
        Self(format!("{namespace}{}", code.as_str()))
    }

    /// Random identity for a joiner: `<namespace><random>-<unix millis, hex>`.
    pub fn ephemeral(namespace: &str) -> Self {
        let random: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(EPHEMERAL_RANDOM_LEN)
            .map(char::from)
            .collect();
        Self(format!(
            "{namespace}{}-{:x}",
            random.to_ascii_lowercase(),
            unix_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl From<String> for PeerIdentity {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

// ---------------------------------------------------------------------------
// RoomCode
// ---------------------------------------------------------------------------

/// Short, human-shareable name of a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomCodeError {
    #[error("room code is empty")]
    Empty,
    #[error("room code is longer than {MAX_ROOM_CODE_LEN} characters")]
    TooLong,
    #[error("room code contains invalid character {0:?}")]
    InvalidChar(char),
}

impl RoomCode {
    /// Fresh five-digit code.
    pub fn generate() -> Self {
        let n: u32 = rand::thread_rng().gen_range(10_000..100_000);
        Self(n.to_string())
    }

    /// Validate user input: ASCII alphanumerics and dashes, surrounding
    /// whitespace ignored.
    pub fn parse(raw: &str) -> Result<Self, RoomCodeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RoomCodeError::Empty);
        }
        if trimmed.len() > MAX_ROOM_CODE_LEN {
            return Err(RoomCodeError::TooLong);
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
        {
            return Err(RoomCodeError::InvalidChar(bad));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the UNIX epoch (0 if the clock is before it).
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
