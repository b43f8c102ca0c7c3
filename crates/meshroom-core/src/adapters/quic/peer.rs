//! Quinn-based [`PeerTransport`] adapter.
//!
//! One UDP endpoint per transport acts as both client and server:
//!
//! - outbound, it holds the signaling connection (one control stream,
//!   request/response) and dials peers directly at the address the signaling
//!   server observed for them;
//! - inbound, it accepts peer connections whose first frame is a
//!   [`PeerHello`] naming the dialer.
//!
//! Each channel is one QUIC connection with a single bidirectional stream of
//! length-prefixed payloads.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{Connection, ConnectionError, Endpoint, RecvStream, SendStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::application::ports::{
    ChannelHandle, LinkEvent, LinkEvents, LinkId, PeerTransport, TransportConnector,
};
use crate::config::SessionConfig;
use crate::domain::identity::PeerIdentity;
use crate::error::TransportError;

use super::codec::{read_frame, read_msg, write_frame, write_msg, PeerHello, SignalMsg, SERVER_NAME};
use super::tls;

/// How long an inbound connection gets to introduce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

type EventTx = mpsc::UnboundedSender<LinkEvent>;

fn network(e: impl std::fmt::Display) -> TransportError {
    TransportError::Network(e.to_string())
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// One direct connection to a remote identity.
#[derive(Debug)]
pub struct QuicChannel {
    link: LinkId,
    remote: PeerIdentity,
    connection: Connection,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl QuicChannel {
    /// Wire up writer and reader tasks for an established stream pair.
    fn spawn(
        link: LinkId,
        remote: PeerIdentity,
        connection: Connection,
        send: SendStream,
        recv: RecvStream,
        events: EventTx,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(write_loop(send, outbound_rx));
        tokio::spawn(read_loop(
            link,
            remote.clone(),
            recv,
            connection.clone(),
            Arc::clone(&closed),
            events,
        ));
        Arc::new(Self {
            link,
            remote,
            connection,
            outbound,
            closed,
        })
    }
}

impl ChannelHandle for QuicChannel {
    fn link_id(&self) -> LinkId {
        self.link
    }

    fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed(self.remote.clone()));
        }
        self.outbound
            .send(payload)
            .map_err(|_| TransportError::ChannelClosed(self.remote.clone()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(peer = %self.remote, link = self.link.0, "Closing QUIC channel");
            self.connection.close(0u32.into(), b"closed");
        }
    }
}

async fn write_loop(mut send: SendStream, mut outbound: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(payload) = outbound.recv().await {
        if let Err(e) = write_frame(&mut send, &payload).await {
            debug!("Channel writer stopped: {e}");
            return;
        }
    }
    let _ = send.finish();
}

async fn read_loop(
    link: LinkId,
    remote: PeerIdentity,
    mut recv: RecvStream,
    connection: Connection,
    closed: Arc<AtomicBool>,
    events: EventTx,
) {
    let failure = loop {
        match read_frame(&mut recv).await {
            Ok(payload) => {
                trace!(peer = %remote, len = payload.len(), "Payload received");
                let _ = events.send(LinkEvent::Data {
                    remote: remote.clone(),
                    link,
                    payload: Bytes::from(payload),
                });
            }
            Err(e) => break e,
        }
    };

    // Closed locally: the session already knows.
    if closed.swap(true, Ordering::AcqRel) {
        return;
    }
    let event = match connection.close_reason() {
        Some(ConnectionError::ApplicationClosed(_)) | Some(ConnectionError::LocallyClosed) | None => {
            LinkEvent::Closed { remote, link }
        }
        Some(reason) => LinkEvent::Error {
            remote,
            link,
            error: network(reason),
        },
    };
    debug!(link = link.0, "Channel reader stopped: {failure}");
    let _ = events.send(event);
}

// ---------------------------------------------------------------------------
// Signaling link
// ---------------------------------------------------------------------------

struct SignalLink {
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
}

impl SignalLink {
    async fn request(&mut self, msg: &SignalMsg) -> anyhow::Result<SignalMsg> {
        write_msg(&mut self.send, msg).await?;
        read_msg(&mut self.recv).await
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct QuicPeerTransport {
    endpoint: Endpoint,
    signaling_addr: SocketAddr,
    signaling: tokio::sync::Mutex<Option<SignalLink>>,
    signaling_up: Arc<AtomicBool>,
    /// Bumped whenever the current signaling link is replaced or dropped on
    /// purpose, so a stale watcher stays quiet.
    signaling_generation: Arc<AtomicU64>,
    local: Arc<Mutex<Option<PeerIdentity>>>,
    events: EventTx,
    channels: Arc<Mutex<Vec<Arc<QuicChannel>>>>,
    next_link: Arc<AtomicU64>,
    accept_task: JoinHandle<()>,
    torn_down: AtomicBool,
}

impl QuicPeerTransport {
    /// Bind an endpoint and start accepting peer connections. The signaling
    /// server is contacted lazily by the first `register`.
    pub fn bind(
        bind_addr: SocketAddr,
        signaling_addr: SocketAddr,
    ) -> anyhow::Result<(Self, LinkEvents)> {
        let mut endpoint = Endpoint::server(tls::self_signed_server_config()?, bind_addr)?;
        endpoint.set_default_client_config(tls::insecure_client_config()?);
        info!(addr = %endpoint.local_addr()?, %signaling_addr, "QUIC peer endpoint bound");

        let (events, rx) = mpsc::unbounded_channel();
        let local = Arc::new(Mutex::new(None));
        let channels = Arc::new(Mutex::new(Vec::new()));
        let next_link = Arc::new(AtomicU64::new(1));

        let accept_task = tokio::spawn(accept_loop(
            endpoint.clone(),
            Arc::clone(&local),
            Arc::clone(&channels),
            Arc::clone(&next_link),
            events.clone(),
        ));

        let transport = Self {
            endpoint,
            signaling_addr,
            signaling: tokio::sync::Mutex::new(None),
            signaling_up: Arc::new(AtomicBool::new(false)),
            signaling_generation: Arc::new(AtomicU64::new(0)),
            local,
            events,
            channels,
            next_link,
            accept_task,
            torn_down: AtomicBool::new(false),
        };
        Ok((transport, rx))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    fn local(&self) -> Option<PeerIdentity> {
        self.local.lock().unwrap().clone()
    }

    fn check_live(&self) -> Result<(), TransportError> {
        if self.torn_down.load(Ordering::Acquire) {
            Err(TransportError::TornDown)
        } else {
            Ok(())
        }
    }

    /// Open a fresh signaling connection and watch it for loss.
    async fn connect_signaling(&self) -> anyhow::Result<SignalLink> {
        debug!(addr = %self.signaling_addr, "Connecting to signaling server");
        let connection = self.endpoint.connect(self.signaling_addr, SERVER_NAME)?.await?;
        let (send, recv) = connection.open_bi().await?;

        // `signaling_up` is only raised once a registration on this link is
        // accepted.
        let generation = self.signaling_generation.load(Ordering::Acquire);
        let watched = connection.clone();
        let current = Arc::clone(&self.signaling_generation);
        let up = Arc::clone(&self.signaling_up);
        let events = self.events.clone();
        tokio::spawn(async move {
            let reason = watched.closed().await;
            if current.load(Ordering::Acquire) == generation && up.swap(false, Ordering::AcqRel) {
                warn!("Signaling connection lost: {reason}");
                let _ = events.send(LinkEvent::SignalingLost);
            }
        });
        Ok(SignalLink {
            connection,
            send,
            recv,
        })
    }

    /// Run one request on the signaling link, connecting first if needed.
    async fn signal(&self, msg: &SignalMsg) -> Result<SignalMsg, TransportError> {
        let mut guard = self.signaling.lock().await;
        if guard.is_none() {
            let link = self
                .connect_signaling()
                .await
                .map_err(|e| TransportError::SignalingUnreachable(e.to_string()))?;
            *guard = Some(link);
        }
        let Some(link) = guard.as_mut() else {
            return Err(TransportError::SignalingUnreachable("no signaling link".into()));
        };
        match link.request(msg).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if let Some(broken) = guard.take() {
                    self.retire(broken, b"broken");
                }
                Err(TransportError::SignalingUnreachable(e.to_string()))
            }
        }
    }

    /// Close a signaling link on purpose; its watcher will not report it.
    fn retire(&self, link: SignalLink, reason: &[u8]) {
        self.signaling_generation.fetch_add(1, Ordering::AcqRel);
        self.signaling_up.store(false, Ordering::Release);
        link.connection.close(0u32.into(), reason);
    }

    async fn register_on_link(
        &self,
        requested: Option<PeerIdentity>,
    ) -> Result<PeerIdentity, TransportError> {
        let outcome = match self.signal(&SignalMsg::Register { requested }).await? {
            SignalMsg::Registered { id, observed } => {
                info!(peer = %id, %observed, "Registered with signaling server");
                *self.local.lock().unwrap() = Some(id.clone());
                self.signaling_up.store(true, Ordering::Release);
                return Ok(id);
            }
            SignalMsg::IdTaken { id } => TransportError::IdTaken(id),
            other => TransportError::SignalingUnreachable(format!("unexpected answer {other:?}")),
        };
        // A link that holds no registration is useless; drop it so the next
        // attempt (or liveness probe) starts from a fresh connection.
        if let Some(link) = self.signaling.lock().await.take() {
            self.retire(link, b"unregistered");
        }
        Err(outcome)
    }
}

#[async_trait]
impl PeerTransport for QuicPeerTransport {
    async fn register(
        &self,
        requested: Option<PeerIdentity>,
    ) -> Result<PeerIdentity, TransportError> {
        self.check_live()?;
        self.register_on_link(requested).await
    }

    async fn dial(&self, remote: &PeerIdentity) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        self.check_live()?;
        let Some(local) = self.local() else {
            return Err(TransportError::Network("dial before register".into()));
        };

        let addr = match self.signal(&SignalMsg::Resolve { id: remote.clone() }).await? {
            SignalMsg::Resolved { addr: Some(addr), .. } => addr,
            SignalMsg::Resolved { addr: None, .. } => {
                return Err(TransportError::PeerUnavailable(remote.clone()))
            }
            other => return Err(network(format!("unexpected answer {other:?}"))),
        };

        debug!(peer = %remote, %addr, "Dialing peer");
        let connection = self
            .endpoint
            .connect(addr, SERVER_NAME)
            .map_err(network)?
            .await
            .map_err(network)?;
        let (mut send, recv) = connection.open_bi().await.map_err(network)?;
        write_msg(&mut send, &PeerHello { from: local })
            .await
            .map_err(network)?;

        let link = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed));
        let channel = QuicChannel::spawn(
            link,
            remote.clone(),
            connection,
            send,
            recv,
            self.events.clone(),
        );
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn reconnect_signaling(&self) -> Result<(), TransportError> {
        self.check_live()?;
        let Some(local) = self.local() else {
            return Err(TransportError::SignalingUnreachable("not registered".into()));
        };
        {
            let mut guard = self.signaling.lock().await;
            if let Some(old) = guard.take() {
                self.retire(old, b"reconnect");
            }
        }
        self.register_on_link(Some(local)).await.map(|_| ())
    }

    fn signaling_connected(&self) -> bool {
        self.signaling_up.load(Ordering::Acquire)
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels = std::mem::take(&mut *self.channels.lock().unwrap());
        for channel in channels {
            channel.close();
        }
        if let Some(link) = self.signaling.lock().await.take() {
            self.retire(link, b"teardown");
        }
        self.accept_task.abort();
        self.endpoint.close(0u32.into(), b"teardown");
        let local = self.local.lock().unwrap().take();
        info!(peer = ?local, "QUIC transport torn down");
    }
}

impl Drop for QuicPeerTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    endpoint: Endpoint,
    local: Arc<Mutex<Option<PeerIdentity>>>,
    channels: Arc<Mutex<Vec<Arc<QuicChannel>>>>,
    next_link: Arc<AtomicU64>,
    events: EventTx,
) {
    while let Some(incoming) = endpoint.accept().await {
        let local = Arc::clone(&local);
        let channels = Arc::clone(&channels);
        let next_link = Arc::clone(&next_link);
        let events = events.clone();
        tokio::spawn(async move {
            if local.lock().unwrap().is_none() {
                debug!("Refusing peer connection before registration");
                incoming.refuse();
                return;
            }
            match accept_channel(incoming, &next_link, events).await {
                Ok(channel) => channels.lock().unwrap().push(channel),
                Err(e) => warn!("Failed to accept peer connection: {e}"),
            }
        });
    }
}

async fn accept_channel(
    incoming: quinn::Incoming,
    next_link: &AtomicU64,
    events: EventTx,
) -> anyhow::Result<Arc<QuicChannel>> {
    let connection = incoming.await?;
    let (send, mut recv) = connection.accept_bi().await?;
    let hello: PeerHello = tokio::time::timeout(HELLO_TIMEOUT, read_msg(&mut recv)).await??;
    info!(peer = %hello.from, addr = %connection.remote_address(), "Peer connected (inbound)");

    let link = LinkId(next_link.fetch_add(1, Ordering::Relaxed));
    let channel = QuicChannel::spawn(link, hello.from, connection, send, recv, events.clone());
    let _ = events.send(LinkEvent::Incoming(Arc::clone(&channel) as Arc<dyn ChannelHandle>));
    Ok(channel)
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens a [`QuicPeerTransport`] per session attempt.
#[derive(Debug, Clone)]
pub struct QuicConnector {
    signaling_addr: SocketAddr,
    bind_addr: SocketAddr,
}

impl QuicConnector {
    pub fn new(signaling_addr: SocketAddr) -> Self {
        Self {
            signaling_addr,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    #[must_use]
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    async fn open(
        &self,
        config: &SessionConfig,
    ) -> Result<(Arc<dyn PeerTransport>, LinkEvents), TransportError> {
        if !config.relay_servers.is_empty() {
            // Direct connections only; relays are carried for future traversal support.
            info!(relays = ?config.relay_servers, "Relay servers configured (pass-through)");
        }
        let (transport, events) =
            QuicPeerTransport::bind(self.bind_addr, self.signaling_addr).map_err(network)?;
        Ok((Arc::new(transport), events))
    }
}
