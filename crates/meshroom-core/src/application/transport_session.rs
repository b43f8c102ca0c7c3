//! Transport session: one local identity plus the channels opened from it.
//!
//! A session is single-use: once [`TransportSession::disconnect`] has run, a
//! new session must be built to try again. Raw transport occurrences are
//! normalized into [`SessionEvent`]s that the owning task pulls one at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::domain::identity::PeerIdentity;
use crate::domain::session::SessionState;
use crate::error::SessionError;

use super::ports::{ChannelHandle, LinkEvent, LinkEvents, LinkId, PeerTransport};

/// Normalized event surface of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A channel to `0` opened (either direction).
    Connected(PeerIdentity),
    /// The channel to `0` closed or failed.
    Disconnected(PeerIdentity),
    Message { from: PeerIdentity, payload: Bytes },
    Error(SessionError),
    SignalingLost,
}

pub struct TransportSession {
    transport: Arc<dyn PeerTransport>,
    /// `None` once the session has been disconnected; late events are dropped
    /// with the receiver.
    link_events: Option<LinkEvents>,
    local: Option<PeerIdentity>,
    channels: HashMap<PeerIdentity, Arc<dyn ChannelHandle>>,
    /// Events produced synchronously (e.g. by `connect`) ahead of queued ones.
    pending: VecDeque<SessionEvent>,
    state: SessionState,
    probe_timeout: Duration,
}

impl TransportSession {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        link_events: LinkEvents,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            link_events: Some(link_events),
            local: None,
            channels: HashMap::new(),
            pending: VecDeque::new(),
            state: SessionState::Disconnected,
            probe_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_identity(&self) -> Option<&PeerIdentity> {
        self.local.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.link_events.is_none()
    }

    /// Remote identities with an open channel.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.channels.keys().cloned().collect()
    }

    pub(crate) fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::clone(&self.transport)
    }

    // -----------------------------------------------------------------------
    // Identity + channels
    // -----------------------------------------------------------------------

    /// Acquire a local identity from the signaling layer.
    ///
    /// The signaling layer gets `probe_timeout` to answer before this fails
    /// with `SignalingUnreachable`.
    pub async fn initialize(
        &mut self,
        requested: Option<PeerIdentity>,
    ) -> Result<PeerIdentity, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if let Some(local) = &self.local {
            return Ok(local.clone());
        }

        self.state = SessionState::Connecting;
        let registration =
            tokio::time::timeout(self.probe_timeout, self.transport.register(requested.clone()))
                .await;

        match registration {
            Ok(Ok(id)) => {
                info!(local = %id, "Registered with signaling layer");
                self.local = Some(id.clone());
                self.state = SessionState::Connected;
                Ok(id)
            }
            Ok(Err(e)) => {
                debug!(?requested, "Registration failed: {e}");
                self.state = SessionState::Disconnected;
                Err(e.into())
            }
            Err(_) => {
                warn!(timeout = ?self.probe_timeout, "Signaling layer did not answer");
                self.state = SessionState::Disconnected;
                Err(SessionError::SignalingUnreachable(format!(
                    "no answer within {:?}",
                    self.probe_timeout
                )))
            }
        }
    }

    /// Open a channel to `remote`.
    ///
    /// On success a `Connected(remote)` event is queued ahead of any
    /// transport events, so consumers see both directions the same way.
    pub async fn connect(&mut self, remote: &PeerIdentity) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let handle = self.transport.dial(remote).await?;
        if self.is_closed() {
            // Torn down while the dial was in flight.
            handle.close();
            return Err(SessionError::Closed);
        }
        info!(peer = %remote, link = handle.link_id().0, "Channel opened (outbound)");
        self.adopt(handle);
        self.pending
            .push_back(SessionEvent::Connected(remote.clone()));
        Ok(())
    }

    /// Enqueue `payload` on the channel to `remote`. Returns whether it was
    /// accepted; a missing or broken channel is not an error.
    pub fn send(&self, remote: &PeerIdentity, payload: Bytes) -> bool {
        match self.channels.get(remote) {
            Some(channel) => match channel.send(payload) {
                Ok(()) => true,
                Err(e) => {
                    warn!(peer = %remote, "Send failed: {e}");
                    false
                }
            },
            None => {
                debug!(peer = %remote, "Send skipped: no channel");
                false
            }
        }
    }

    /// Best-effort send to every open channel.
    pub fn broadcast(&self, payload: Bytes) -> Vec<(PeerIdentity, bool)> {
        self.broadcast_except(payload, &[])
    }

    /// Best-effort send to every open channel whose remote is not in `exclude`.
    pub fn broadcast_except(
        &self,
        payload: Bytes,
        exclude: &[&PeerIdentity],
    ) -> Vec<(PeerIdentity, bool)> {
        self.channels
            .keys()
            .filter(|remote| !exclude.contains(remote))
            .map(|remote| (remote.clone(), self.send(remote, payload.clone())))
            .collect()
    }

    /// Close the channel to `remote`, if any, and queue `Disconnected(remote)`.
    pub fn disconnect_from(&mut self, remote: &PeerIdentity) {
        if let Some(channel) = self.channels.remove(remote) {
            info!(peer = %remote, "Closing channel");
            channel.close();
            self.pending
                .push_back(SessionEvent::Disconnected(remote.clone()));
        }
    }

    /// Close every channel and release the local identity. Idempotent; the
    /// session is unusable afterwards.
    pub async fn disconnect(&mut self) {
        if self.link_events.take().is_none() {
            debug!("Session already disconnected");
            return;
        }
        for (remote, channel) in self.channels.drain() {
            trace!(peer = %remote, "Closing channel on teardown");
            channel.close();
        }
        self.pending.clear();
        self.transport.teardown().await;
        if let Some(local) = self.local.take() {
            info!(local = %local, "Session torn down, identity released");
        }
        self.state = SessionState::Disconnected;
    }

    // -----------------------------------------------------------------------
    // Event surface
    // -----------------------------------------------------------------------

    /// Wait for the next normalized event.
    ///
    /// Returns `None` when the session is disconnected or the transport has
    /// dropped its end of the queue. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let raw = self.link_events.as_mut()?.recv().await?;
            if let Some(event) = self.apply(raw) {
                return Some(event);
            }
        }
    }

    /// Like [`next_event`](Self::next_event) but never waits.
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let raw = self.link_events.as_mut()?.try_recv().ok()?;
            if let Some(event) = self.apply(raw) {
                return Some(event);
            }
        }
    }

    fn adopt(&mut self, handle: Arc<dyn ChannelHandle>) {
        let remote = handle.remote().clone();
        if let Some(previous) = self.channels.insert(remote.clone(), handle) {
            debug!(peer = %remote, old_link = previous.link_id().0, "Replacing existing channel");
            previous.close();
        }
    }

    fn is_current(&self, remote: &PeerIdentity, link: LinkId) -> bool {
        self.channels
            .get(remote)
            .is_some_and(|channel| channel.link_id() == link)
    }

    /// Fold one raw transport event into the channel map.
    fn apply(&mut self, raw: LinkEvent) -> Option<SessionEvent> {
        match raw {
            LinkEvent::Incoming(handle) => {
                let remote = handle.remote().clone();
                info!(peer = %remote, link = handle.link_id().0, "Channel opened (inbound)");
                self.adopt(handle);
                Some(SessionEvent::Connected(remote))
            }
            LinkEvent::Data {
                remote,
                link,
                payload,
            } => {
                if self.is_current(&remote, link) {
                    Some(SessionEvent::Message {
                        from: remote,
                        payload,
                    })
                } else {
                    trace!(peer = %remote, link = link.0, "Dropping data from stale channel");
                    None
                }
            }
            LinkEvent::Closed { remote, link } => {
                if self.is_current(&remote, link) {
                    self.channels.remove(&remote);
                    info!(peer = %remote, "Channel closed by remote");
                    Some(SessionEvent::Disconnected(remote))
                } else {
                    None
                }
            }
            LinkEvent::Error {
                remote,
                link,
                error,
            } => {
                if !self.is_current(&remote, link) {
                    return None;
                }
                warn!(peer = %remote, "Channel error: {error}");
                if let Some(channel) = self.channels.remove(&remote) {
                    channel.close();
                }
                self.pending
                    .push_back(SessionEvent::Disconnected(remote));
                Some(SessionEvent::Error(error.into()))
            }
            LinkEvent::SignalingLost => {
                warn!("Lost connection to signaling layer");
                Some(SessionEvent::SignalingLost)
            }
        }
    }
}
