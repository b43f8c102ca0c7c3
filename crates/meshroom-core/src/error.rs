//! Error taxonomy for sessions and the transport port.

use thiserror::Error;

use crate::domain::identity::PeerIdentity;
use crate::domain::session::Role;

/// Failures reported by a [`PeerTransport`](crate::application::ports::PeerTransport)
/// implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("identity {0} is already registered")]
    IdTaken(PeerIdentity),

    #[error("signaling layer unreachable: {0}")]
    SignalingUnreachable(String),

    #[error("peer {0} is not registered")]
    PeerUnavailable(PeerIdentity),

    #[error("network error: {0}")]
    Network(String),

    #[error("channel to {0} is closed")]
    ChannelClosed(PeerIdentity),

    #[error("transport has been torn down")]
    TornDown,
}

/// Fieldless discriminant of [`SessionError`], handed to presentation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IdentityTaken,
    IdentityExhausted,
    SignalingUnreachable,
    PeerUnavailable,
    Network,
    ConnectionTimeout,
    ProtocolViolation,
    Closed,
    Unknown,
}

/// Session-level failures.
///
/// Only `IdentityTaken` is retried internally; every other variant is
/// terminal until the user asks for a retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("identity {0} is already taken")]
    IdentityTaken(PeerIdentity),

    #[error("identity still taken after {attempts} attempts")]
    IdentityExhausted { attempts: u32 },

    #[error("signaling server unreachable: {0}")]
    SignalingUnreachable(String),

    #[error("peer {0} is unavailable")]
    PeerUnavailable(PeerIdentity),

    #[error("network error: {0}")]
    Network(String),

    #[error("connection timed out ({role}): {}", .role.timeout_hint())]
    ConnectionTimeout { role: Role },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("session is closed")]
    Closed,

    #[error("{0}")]
    Unknown(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IdentityTaken(_) => ErrorKind::IdentityTaken,
            Self::IdentityExhausted { .. } => ErrorKind::IdentityExhausted,
            Self::SignalingUnreachable(_) => ErrorKind::SignalingUnreachable,
            Self::PeerUnavailable(_) => ErrorKind::PeerUnavailable,
            Self::Network(_) => ErrorKind::Network,
            Self::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::Closed => ErrorKind::Closed,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::IdTaken(id) => Self::IdentityTaken(id),
            TransportError::SignalingUnreachable(detail) => Self::SignalingUnreachable(detail),
            TransportError::PeerUnavailable(id) => Self::PeerUnavailable(id),
            TransportError::Network(detail) => Self::Network(detail),
            TransportError::ChannelClosed(id) => Self::Network(format!("channel to {id} closed")),
            TransportError::TornDown => Self::Closed,
        }
    }
}

/// Failure to load a [`SessionConfig`](crate::config::SessionConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
