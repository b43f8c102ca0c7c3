//! In-process [`PeerTransport`]: every transport opened from one
//! [`LoopbackHub`] shares a registry, so peers can find and dial each other
//! without any network.
//!
//! The hub doubles as a fault injector: it can refuse registrations, stall
//! the signaling layer or dials, drop a peer's signaling link and sever
//! individual channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::application::ports::{
    ChannelHandle, LinkEvent, LinkEvents, LinkId, PeerTransport, TransportConnector,
};
use crate::config::SessionConfig;
use crate::domain::identity::PeerIdentity;
use crate::error::TransportError;

type EventTx = mpsc::UnboundedSender<LinkEvent>;

struct Endpoint {
    transport: u64,
    events: EventTx,
    signaling_up: bool,
}

#[derive(Default)]
struct HubState {
    registry: HashMap<PeerIdentity, Endpoint>,
    /// Pending forced `IdTaken` answers per requested identity.
    rejections: HashMap<PeerIdentity, u32>,
    attempts: HashMap<PeerIdentity, u32>,
    reconnects: HashMap<PeerIdentity, u32>,
    /// Channels owned by each transport, for teardown.
    channels: HashMap<u64, Vec<Arc<LoopbackChannel>>>,
    signaling_stalled: bool,
    dials_stalled: bool,
    next_link: u64,
    next_transport: u64,
    next_assigned: u64,
    teardowns: u32,
}

impl HubState {
    fn link_id(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }
}

/// Shared registry standing in for a signaling server.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector producing transports attached to this hub.
    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector { hub: self.clone() }
    }

    pub fn is_registered(&self, id: &PeerIdentity) -> bool {
        self.state.lock().unwrap().registry.contains_key(id)
    }

    /// Registered identities, sorted.
    pub fn registered(&self) -> Vec<PeerIdentity> {
        let mut ids: Vec<_> = self.state.lock().unwrap().registry.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// When `false`, registrations never get an answer.
    pub fn set_signaling_responsive(&self, responsive: bool) {
        self.state.lock().unwrap().signaling_stalled = !responsive;
    }

    /// When `false`, dials never complete.
    pub fn set_dial_responsive(&self, responsive: bool) {
        self.state.lock().unwrap().dials_stalled = !responsive;
    }

    /// Answer the next `times` registrations of `id` with `IdTaken`.
    pub fn reject_registrations(&self, id: &PeerIdentity, times: u32) {
        self.state
            .lock()
            .unwrap()
            .rejections
            .insert(id.clone(), times);
    }

    /// How many times `id` has been requested, successful or not.
    pub fn registration_attempts(&self, id: &PeerIdentity) -> u32 {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Cut `id`'s signaling link. Its channels stay open.
    pub fn drop_signaling(&self, id: &PeerIdentity) {
        let mut state = self.state.lock().unwrap();
        if let Some(endpoint) = state.registry.get_mut(id) {
            endpoint.signaling_up = false;
            let _ = endpoint.events.send(LinkEvent::SignalingLost);
            debug!(peer = %id, "Loopback signaling dropped");
        }
    }

    pub fn reconnects(&self, id: &PeerIdentity) -> u32 {
        self.state
            .lock()
            .unwrap()
            .reconnects
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Close every channel between `a` and `b`; both ends see `Closed`.
    pub fn sever(&self, a: &PeerIdentity, b: &PeerIdentity) {
        let state = self.state.lock().unwrap();
        // Both ends share one `closed` flag, so pick the open ends before
        // flipping any of them.
        let ends: Vec<&Arc<LoopbackChannel>> = state
            .channels
            .values()
            .flatten()
            .filter(|channel| {
                let between = (channel.local == *a && channel.remote == *b)
                    || (channel.local == *b && channel.remote == *a);
                between && !channel.closed.load(Ordering::Acquire)
            })
            .collect();
        for channel in &ends {
            channel.closed.store(true, Ordering::Release);
        }
        for channel in ends {
            debug!(local = %channel.local, remote = %channel.remote, link = channel.link.0, "Loopback channel severed");
            let _ = channel.own_events.send(LinkEvent::Closed {
                remote: channel.remote.clone(),
                link: channel.link,
            });
        }
    }

    /// Inject a channel error on `local`'s channel to `remote`.
    pub fn fail_channel(&self, local: &PeerIdentity, remote: &PeerIdentity, detail: &str) {
        let state = self.state.lock().unwrap();
        for channel in state.channels.values().flatten() {
            if channel.local == *local
                && channel.remote == *remote
                && !channel.closed.load(Ordering::Acquire)
            {
                let _ = channel.own_events.send(LinkEvent::Error {
                    remote: remote.clone(),
                    link: channel.link,
                    error: TransportError::Network(detail.to_owned()),
                });
            }
        }
    }

    /// Number of transports that have been torn down.
    pub fn teardowns(&self) -> u32 {
        self.state.lock().unwrap().teardowns
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// One end of an in-process channel. Both ends share the `closed` flag.
#[derive(Debug)]
pub struct LoopbackChannel {
    link: LinkId,
    local: PeerIdentity,
    remote: PeerIdentity,
    closed: Arc<AtomicBool>,
    /// Queue of the transport owning this end.
    own_events: EventTx,
    /// Queue of the transport owning the other end.
    peer_events: EventTx,
}

impl ChannelHandle for LoopbackChannel {
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
        self.peer_events
            .send(LinkEvent::Data {
                remote: self.local.clone(),
                link: self.link,
                payload,
            })
            .map_err(|_| TransportError::ChannelClosed(self.remote.clone()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.peer_events.send(LinkEvent::Closed {
                remote: self.local.clone(),
                link: self.link,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct LoopbackTransport {
    hub: LoopbackHub,
    id: u64,
    events: EventTx,
    local: Mutex<Option<PeerIdentity>>,
    torn_down: AtomicBool,
}

impl LoopbackTransport {
    fn local(&self) -> Option<PeerIdentity> {
        self.local.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn register(
        &self,
        requested: Option<PeerIdentity>,
    ) -> Result<PeerIdentity, TransportError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(TransportError::TornDown);
        }
        {
            let mut state = self.hub.state.lock().unwrap();
            if !state.signaling_stalled {
                let id = match requested {
                    Some(id) => id,
                    None => {
                        state.next_assigned += 1;
                        PeerIdentity::new(format!("peer-{}", state.next_assigned))
                    }
                };
                *state.attempts.entry(id.clone()).or_insert(0) += 1;

                if let Some(left) = state.rejections.get_mut(&id).filter(|n| **n > 0) {
                    *left -= 1;
                    return Err(TransportError::IdTaken(id));
                }
                if state.registry.contains_key(&id) {
                    return Err(TransportError::IdTaken(id));
                }

                state.registry.insert(
                    id.clone(),
                    Endpoint {
                        transport: self.id,
                        events: self.events.clone(),
                        signaling_up: true,
                    },
                );
                *self.local.lock().unwrap() = Some(id.clone());
                debug!(peer = %id, "Loopback registered");
                return Ok(id);
            }
        }
        std::future::pending().await
    }

    async fn dial(&self, remote: &PeerIdentity) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(TransportError::TornDown);
        }
        let Some(local) = self.local() else {
            return Err(TransportError::Network("dial before register".into()));
        };
        {
            let mut state = self.hub.state.lock().unwrap();
            if !state.dials_stalled {
                let (remote_transport, remote_events) = match state.registry.get(remote) {
                    Some(ep) if ep.signaling_up => (ep.transport, ep.events.clone()),
                    _ => return Err(TransportError::PeerUnavailable(remote.clone())),
                };
                let link = state.link_id();
                let closed = Arc::new(AtomicBool::new(false));
                let ours = Arc::new(LoopbackChannel {
                    link,
                    local: local.clone(),
                    remote: remote.clone(),
                    closed: Arc::clone(&closed),
                    own_events: self.events.clone(),
                    peer_events: remote_events.clone(),
                });
                let theirs = Arc::new(LoopbackChannel {
                    link,
                    local: remote.clone(),
                    remote: local,
                    closed,
                    own_events: remote_events.clone(),
                    peer_events: self.events.clone(),
                });
                state
                    .channels
                    .entry(self.id)
                    .or_default()
                    .push(Arc::clone(&ours));
                state
                    .channels
                    .entry(remote_transport)
                    .or_default()
                    .push(Arc::clone(&theirs));
                let _ = remote_events.send(LinkEvent::Incoming(theirs));
                return Ok(ours);
            }
        }
        std::future::pending().await
    }

    async fn reconnect_signaling(&self) -> Result<(), TransportError> {
        let Some(local) = self.local() else {
            return Err(TransportError::SignalingUnreachable("not registered".into()));
        };
        let mut state = self.hub.state.lock().unwrap();
        if state.signaling_stalled {
            return Err(TransportError::SignalingUnreachable("hub stalled".into()));
        }
        *state.reconnects.entry(local.clone()).or_insert(0) += 1;
        match state.registry.get_mut(&local) {
            Some(endpoint) => {
                endpoint.signaling_up = true;
                info!(peer = %local, "Loopback signaling restored");
                Ok(())
            }
            None => Err(TransportError::TornDown),
        }
    }

    fn signaling_connected(&self) -> bool {
        let Some(local) = self.local() else {
            return false;
        };
        self.hub
            .state
            .lock()
            .unwrap()
            .registry
            .get(&local)
            .is_some_and(|endpoint| endpoint.signaling_up)
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let local = self.local.lock().unwrap().take();
        let mut state = self.hub.state.lock().unwrap();
        if let Some(local) = &local {
            let ours = state
                .registry
                .get(local)
                .is_some_and(|endpoint| endpoint.transport == self.id);
            if ours {
                state.registry.remove(local);
            }
        }
        for channel in state.channels.remove(&self.id).unwrap_or_default() {
            channel.close();
        }
        state.teardowns += 1;
        debug!(peer = ?local, "Loopback transport torn down");
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LoopbackConnector {
    hub: LoopbackHub,
}

#[async_trait]
impl TransportConnector for LoopbackConnector {
    async fn open(
        &self,
        _config: &SessionConfig,
    ) -> Result<(Arc<dyn PeerTransport>, LinkEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.hub.state.lock().unwrap();
            state.next_transport += 1;
            state.next_transport
        };
        let transport = LoopbackTransport {
            hub: self.hub.clone(),
            id,
            events: tx,
            local: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        };
        Ok((Arc::new(transport), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(hub: &LoopbackHub) -> (Arc<dyn PeerTransport>, LinkEvents) {
        hub.connector()
            .open(&SessionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn assigned_identities_are_unique() {
        let hub = LoopbackHub::new();
        let (a, _ra) = open(&hub).await;
        let (b, _rb) = open(&hub).await;
        let ia = a.register(None).await.unwrap();
        let ib = b.register(None).await.unwrap();
        assert_ne!(ia, ib);
        assert_eq!(hub.registered().len(), 2);
    }

    #[tokio::test]
    async fn forced_rejections_run_out() {
        let hub = LoopbackHub::new();
        hub.reject_registrations(&"x".into(), 1);
        let (t, _rx) = open(&hub).await;
        assert_eq!(
            t.register(Some("x".into())).await,
            Err(TransportError::IdTaken("x".into()))
        );
        assert!(t.register(Some("x".into())).await.is_ok());
        assert_eq!(hub.registration_attempts(&"x".into()), 2);
    }

    #[tokio::test]
    async fn close_notifies_only_the_remote() {
        let hub = LoopbackHub::new();
        let (a, mut ra) = open(&hub).await;
        let (b, mut rb) = open(&hub).await;
        a.register(Some("a".into())).await.unwrap();
        b.register(Some("b".into())).await.unwrap();

        let channel = a.dial(&"b".into()).await.unwrap();
        assert!(matches!(rb.try_recv(), Ok(LinkEvent::Incoming(_))));

        channel.close();
        channel.close();
        assert!(matches!(rb.try_recv(), Ok(LinkEvent::Closed { .. })));
        assert!(rb.try_recv().is_err());
        assert!(ra.try_recv().is_err());
        assert!(channel.send(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test]
    async fn sever_notifies_both_ends_once() {
        let hub = LoopbackHub::new();
        let (a, mut ra) = open(&hub).await;
        let (b, mut rb) = open(&hub).await;
        a.register(Some("a".into())).await.unwrap();
        b.register(Some("b".into())).await.unwrap();
        let channel = a.dial(&"b".into()).await.unwrap();
        assert!(matches!(rb.try_recv(), Ok(LinkEvent::Incoming(_))));

        hub.sever(&"a".into(), &"b".into());
        hub.sever(&"b".into(), &"a".into());

        match ra.try_recv() {
            Ok(LinkEvent::Closed { remote, link }) => {
                assert_eq!(remote, PeerIdentity::from("b"));
                assert_eq!(link, channel.link_id());
            }
            other => panic!("expected Closed on a, got {other:?}"),
        }
        match rb.try_recv() {
            Ok(LinkEvent::Closed { remote, link }) => {
                assert_eq!(remote, PeerIdentity::from("a"));
                assert_eq!(link, channel.link_id());
            }
            other => panic!("expected Closed on b, got {other:?}"),
        }
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_err());
        assert!(channel.send(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test]
    async fn teardown_frees_identity_and_closes_channels() {
        let hub = LoopbackHub::new();
        let (a, _ra) = open(&hub).await;
        let (b, mut rb) = open(&hub).await;
        a.register(Some("a".into())).await.unwrap();
        b.register(Some("b".into())).await.unwrap();
        a.dial(&"b".into()).await.unwrap();
        let _ = rb.try_recv();

        a.teardown().await;
        a.teardown().await;
        assert_eq!(hub.teardowns(), 1);
        assert!(!hub.is_registered(&"a".into()));
        assert!(matches!(rb.try_recv(), Ok(LinkEvent::Closed { .. })));
        assert_eq!(
            a.register(Some("a".into())).await,
            Err(TransportError::TornDown)
        );
    }

    #[tokio::test]
    async fn dial_to_peer_without_signaling_fails() {
        let hub = LoopbackHub::new();
        let (a, _ra) = open(&hub).await;
        let (b, _rb) = open(&hub).await;
        a.register(Some("a".into())).await.unwrap();
        b.register(Some("b".into())).await.unwrap();

        hub.drop_signaling(&"b".into());
        assert_eq!(
            a.dial(&"b".into()).await.unwrap_err(),
            TransportError::PeerUnavailable("b".into())
        );
        b.reconnect_signaling().await.unwrap();
        assert!(a.dial(&"b".into()).await.is_ok());
    }
}
