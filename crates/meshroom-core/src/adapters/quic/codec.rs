//! Wire format shared by the QUIC transport and the signaling server.
//!
//! Every frame is a `u32` big-endian length followed by the payload. Control
//! messages ([`SignalMsg`], [`PeerHello`]) are CBOR-encoded; channel payloads
//! are carried as-is.

use std::net::SocketAddr;

use anyhow::bail;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::domain::identity::PeerIdentity;

/// Upper bound on a single frame; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// ALPN / server name used for every connection.
pub const SERVER_NAME: &str = "localhost";

/// Requests and responses on the signaling control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalMsg {
    /// Client → server: claim `requested`, or let the server pick.
    Register { requested: Option<PeerIdentity> },
    /// Server → client: registration accepted.
    Registered {
        id: PeerIdentity,
        observed: SocketAddr,
    },
    /// Server → client: identity already held by another connection.
    IdTaken { id: PeerIdentity },
    /// Client → server: where can `id` be reached?
    Resolve { id: PeerIdentity },
    /// Server → client: `None` if `id` is not registered.
    Resolved {
        id: PeerIdentity,
        addr: Option<SocketAddr>,
    },
    /// Server → client: the request made no sense in this state.
    Rejected { reason: String },
}

/// First frame on every peer-to-peer stream: who is dialing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHello {
    pub from: PeerIdentity,
}

pub async fn write_frame<W>(send: &mut W, payload: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit", payload.len());
    }
    let len = (payload.len() as u32).to_be_bytes();
    send.write_all(&len).await?;
    send.write_all(payload).await?;
    Ok(())
}

pub async fn read_frame<R>(recv: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("peer announced a {len} byte frame");
    }

    let mut payload = vec![0u8; len];
    recv.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_msg<W, T>(send: &mut W, msg: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_cbor::to_vec(msg)?;
    write_frame(send, &payload).await
}

pub async fn read_msg<R, T>(recv: &mut R) -> anyhow::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(recv).await?;
    Ok(serde_cbor::from_slice(&payload)?)
}
