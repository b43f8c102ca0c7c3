//! RoomProtocol use case: membership and chat over a peer mesh.
//!
//! Interprets channel payloads as [`RoomFrame`]s and keeps the local view of
//! the room consistent using only peer broadcasts:
//!
//! - a new channel gets our JOIN, then a USER_LIST snapshot;
//! - JOINs that change our view are relayed to everyone except the subject
//!   and the peer we heard it from;
//! - USER_LIST is an idempotent union (never overwrites, never removes);
//! - a closed channel removes its member and is announced as LEAVE.
//!
//! The value is driven by a single task through [`RoomProtocol::step`] (or
//! [`RoomProtocol::run`]); every mutation happens there.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::domain::frame::RoomFrame;
use crate::domain::identity::{unix_millis, PeerIdentity, RoomCode};
use crate::domain::member::{ChatMessage, RoomMember};
use crate::domain::session::{Role, SessionState};
use crate::error::SessionError;

use super::ports::{FrameCodec, Membership, RoomEvents, TransportConnector};
use super::resilience::ResilienceController;
use super::transport_session::SessionEvent;

/// What this process is in a room.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub room_code: RoomCode,
    pub display_name: String,
    pub role: Role,
}

impl RoomConfig {
    pub fn host(room_code: RoomCode, display_name: impl Into<String>) -> Self {
        Self {
            room_code,
            display_name: display_name.into(),
            role: Role::Host,
        }
    }

    pub fn joiner(room_code: RoomCode, display_name: impl Into<String>) -> Self {
        Self {
            room_code,
            display_name: display_name.into(),
            role: Role::Joiner,
        }
    }
}

pub struct RoomProtocol {
    controller: ResilienceController,
    codec: Arc<dyn FrameCodec>,
    membership: Arc<dyn Membership>,
    events: Arc<dyn RoomEvents>,
    room_code: RoomCode,
    display_name: String,
    role: Role,
    /// Identity asked for on the next `join`.
    requested: PeerIdentity,
    /// Key of our own membership entry.
    local: PeerIdentity,
    /// Fixed identity of the room's host.
    host: PeerIdentity,
    /// Last sequence number handed out by `send_message`.
    sequence: u64,
    /// Liveness probe; armed by `join`.
    heartbeat: Option<Interval>,
}

/// One thing `step` woke up for.
enum Wake {
    Event(Option<SessionEvent>),
    Heartbeat,
    Deadline,
}

impl RoomProtocol {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        config: SessionConfig,
        room: RoomConfig,
        codec: Arc<dyn FrameCodec>,
        membership: Arc<dyn Membership>,
        events: Arc<dyn RoomEvents>,
    ) -> Self {
        let host = PeerIdentity::fixed(&config.identity_namespace, &room.room_code);
        let requested = match room.role {
            Role::Host => host.clone(),
            Role::Joiner => PeerIdentity::ephemeral(&config.identity_namespace),
        };
        membership.upsert(RoomMember::new(requested.clone(), room.display_name.clone()));

        let controller =
            ResilienceController::new(connector, config, room.role, Arc::clone(&events));

        Self {
            controller,
            codec,
            membership,
            events,
            room_code: room.room_code,
            display_name: room.display_name,
            role: room.role,
            local: requested.clone(),
            requested,
            host,
            sequence: 0,
            heartbeat: None,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn host_identity(&self) -> &PeerIdentity {
        &self.host
    }

    pub fn room_code(&self) -> &RoomCode {
        &self.room_code
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    /// Snapshot of the membership view, ordered by identity.
    pub fn members(&self) -> Vec<RoomMember> {
        self.membership.members()
    }

    /// Remote identities with an open channel.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.controller
            .session()
            .map(|s| s.peers())
            .unwrap_or_default()
    }

    pub fn controller(&self) -> &ResilienceController {
        &self.controller
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Acquire an identity and, for a joiner, open the channel to the host.
    ///
    /// Resets the local chat sequence. Failures are returned unchanged (they
    /// have already been reported through `on_error`).
    pub async fn join(&mut self) -> Result<PeerIdentity, SessionError> {
        self.sequence = 0;
        info!(room = %self.room_code, role = %self.role, "Joining room");

        let id = self.controller.initialize(self.requested.clone()).await?;
        if id != self.local {
            debug!(old = %self.local, new = %id, "Re-keying local member");
            self.membership.remove(&self.local);
            self.local = id.clone();
        }
        self.membership
            .upsert(RoomMember::new(id.clone(), self.display_name.clone()));

        if self.host != id {
            let host = self.host.clone();
            self.controller.connect(&host).await?;
        }

        let period = self.controller.config().heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
        Ok(id)
    }

    /// Disconnect from everyone and forget the room. No LEAVE is sent for the
    /// local member; peers notice the closed channels.
    pub async fn leave(&mut self) {
        info!(room = %self.room_code, "Leaving room");
        self.heartbeat = None;
        self.controller.teardown().await;
        self.membership.clear();
        self.membership
            .upsert(RoomMember::new(self.local.clone(), self.display_name.clone()));
    }

    /// Tear the session down completely and join again with the same
    /// requested identity and a fresh attempt counter.
    pub async fn reset_and_retry(&mut self) -> Result<PeerIdentity, SessionError> {
        info!(room = %self.room_code, "Retrying");
        self.heartbeat = None;
        self.drop_remote_members();
        self.controller.reset().await?;
        self.join().await
    }

    /// Like [`reset_and_retry`](Self::reset_and_retry) but with a brand-new
    /// identity: a joiner draws a new ephemeral id, a host opens a new room
    /// code.
    pub async fn restart(&mut self) -> Result<PeerIdentity, SessionError> {
        let namespace = self.controller.config().identity_namespace.clone();
        match self.role {
            Role::Joiner => {
                self.requested = PeerIdentity::ephemeral(&namespace);
            }
            Role::Host => {
                let mut code = RoomCode::generate();
                while code == self.room_code {
                    code = RoomCode::generate();
                }
                info!(old = %self.room_code, new = %code, "New room code");
                self.room_code = code;
                self.host = PeerIdentity::fixed(&namespace, &self.room_code);
                self.requested = self.host.clone();
            }
        }
        self.reset_and_retry().await
    }

    fn drop_remote_members(&self) {
        for member in self.membership.members() {
            if member.id != self.local && self.membership.remove(&member.id).is_some() {
                self.events.on_leave(&member.id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Wait for the next session event, heartbeat tick or deadline and handle
    /// it. Cancel-safe: nothing is handled until one of them fires.
    ///
    /// Returns the terminal error when the session fails; the room stays
    /// usable for `reset_and_retry` / `restart`.
    pub async fn step(&mut self) -> Result<(), SessionError> {
        let deadline = self.controller.deadline();
        let wake = tokio::select! {
            event = self.controller.next_event() => Wake::Event(event),
            _ = tick(&mut self.heartbeat) => Wake::Heartbeat,
            _ = sleep_until(deadline) => Wake::Deadline,
        };

        match wake {
            Wake::Event(Some(event)) => {
                self.handle_event(event);
                Ok(())
            }
            Wake::Event(None) => {
                self.heartbeat = None;
                Err(self.controller.transport_lost().await)
            }
            Wake::Heartbeat => {
                self.controller.probe_liveness();
                Ok(())
            }
            Wake::Deadline => {
                self.heartbeat = None;
                Err(self.controller.expire().await)
            }
        }
    }

    /// Drive the room until the session fails.
    pub async fn run(&mut self) -> SessionError {
        loop {
            if let Err(e) = self.step().await {
                return e;
            }
        }
    }

    /// Handle every event that is already queued, without waiting. Returns
    /// how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.controller.try_next_event() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected(remote) => self.on_connected(&remote),
            SessionEvent::Disconnected(remote) => self.on_disconnected(&remote),
            SessionEvent::Message { from, payload } => self.on_payload(&from, &payload),
            SessionEvent::Error(err) => {
                // Per-channel; the matching Disconnected follows.
                warn!("Channel error: {err}");
                self.events.on_error(&err);
            }
            SessionEvent::SignalingLost => self.controller.probe_liveness(),
        }
    }

    fn on_connected(&mut self, remote: &PeerIdentity) {
        self.controller.mark_established();

        let me = self
            .membership
            .get(&self.local)
            .unwrap_or_else(|| RoomMember::new(self.local.clone(), self.display_name.clone()));
        self.send_frame(remote, &RoomFrame::Join { user: me });
        self.send_frame(
            remote,
            &RoomFrame::UserList {
                users: self.membership.members(),
            },
        );
    }

    fn on_disconnected(&mut self, remote: &PeerIdentity) {
        if self.membership.remove(remote).is_none() {
            debug!(peer = %remote, "Channel closed for unknown member");
            return;
        }
        info!(peer = %remote, "Member left (channel closed)");
        self.events.on_leave(remote);
        self.broadcast_frame(
            &RoomFrame::Leave {
                user_id: remote.clone(),
            },
            &[remote],
        );
    }

    fn on_payload(&mut self, from: &PeerIdentity, payload: &[u8]) {
        let frame = match self.codec.decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                let err = SessionError::ProtocolViolation(e.to_string());
                warn!(peer = %from, len = payload.len(), "Dropping frame: {err}");
                return;
            }
        };
        trace!(peer = %from, kind = frame.kind(), "Frame received");

        match frame {
            RoomFrame::Join { user } => self.on_join(from, user),
            RoomFrame::Leave { user_id } => {
                if user_id == self.local {
                    return;
                }
                if self.membership.remove(&user_id).is_some() {
                    info!(peer = %user_id, via = %from, "Member left");
                    self.events.on_leave(&user_id);
                }
            }
            RoomFrame::UserList { users } => {
                for user in users {
                    if user.id == self.local {
                        continue;
                    }
                    let (id, name) = (user.id.clone(), user.display_name.clone());
                    if self.membership.insert_if_absent(user) {
                        info!(peer = %id, name = %name, via = %from, "Member joined (user list)");
                        self.events.on_join(&id, &name);
                    }
                }
            }
            RoomFrame::Chat { message } => {
                self.events.on_message(&message, from);
            }
        }
    }

    fn on_join(&mut self, from: &PeerIdentity, user: RoomMember) {
        if user.id == self.local {
            trace!(via = %from, "Ignoring JOIN about ourselves");
            return;
        }
        let previous = self.membership.upsert(user.clone());
        if previous.as_ref() == Some(&user) {
            trace!(peer = %user.id, "Duplicate JOIN absorbed");
            return;
        }
        info!(peer = %user.id, name = %user.display_name, via = %from, "Member joined");
        self.events.on_join(&user.id, &user.display_name);

        let subject = user.id.clone();
        self.broadcast_frame(&RoomFrame::Join { user }, &[&subject, from]);
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    /// Broadcast `content` to every connected peer and return the message for
    /// local echo.
    pub fn send_message(&mut self, content: impl Into<String>) -> ChatMessage {
        self.sequence += 1;
        let message = ChatMessage {
            sequence: self.sequence,
            sender: self.display_name.clone(),
            content: content.into(),
            timestamp_ms: unix_millis(),
        };
        let results = self.broadcast_frame(
            &RoomFrame::Chat {
                message: message.clone(),
            },
            &[],
        );
        debug!(
            sequence = message.sequence,
            delivered = results.iter().filter(|(_, ok)| *ok).count(),
            peers = results.len(),
            "Chat sent"
        );
        message
    }

    // -----------------------------------------------------------------------
    // Frame plumbing
    // -----------------------------------------------------------------------

    fn encode(&self, frame: &RoomFrame) -> Option<Bytes> {
        match self.codec.encode(frame) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                warn!(kind = frame.kind(), "Failed to encode frame: {e}");
                None
            }
        }
    }

    fn send_frame(&self, to: &PeerIdentity, frame: &RoomFrame) -> bool {
        let Some(session) = self.controller.session() else {
            return false;
        };
        match self.encode(frame) {
            Some(payload) => session.send(to, payload),
            None => false,
        }
    }

    fn broadcast_frame(
        &self,
        frame: &RoomFrame,
        exclude: &[&PeerIdentity],
    ) -> Vec<(PeerIdentity, bool)> {
        let Some(session) = self.controller.session() else {
            return Vec::new();
        };
        match self.encode(frame) {
            Some(payload) => session.broadcast_except(payload, exclude),
            None => Vec::new(),
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapters::codec::CborFrameCodec;
    use crate::adapters::loopback::LoopbackHub;
    use crate::adapters::membership::InMemoryMembership;
    use crate::adapters::recording::RecordingEvents;
    use crate::application::ports::TransportConnector;
    use crate::application::transport_session::TransportSession;
    use crate::error::ErrorKind;

    fn room(hub: &LoopbackHub, room: RoomConfig) -> (RoomProtocol, Arc<RecordingEvents>) {
        let events = Arc::new(RecordingEvents::default());
        let protocol = RoomProtocol::new(
            Arc::new(hub.connector()),
            SessionConfig::default().with_namespace(""),
            room,
            Arc::new(CborFrameCodec),
            Arc::new(InMemoryMembership::new()),
            events.clone(),
        );
        (protocol, events)
    }

    fn code(raw: &str) -> RoomCode {
        RoomCode::parse(raw).unwrap()
    }

    fn settle(rooms: &mut [&mut RoomProtocol]) {
        loop {
            let handled: usize = rooms.iter_mut().map(|r| r.process_pending()).sum();
            if handled == 0 {
                break;
            }
        }
    }

    fn ids(room: &RoomProtocol) -> Vec<PeerIdentity> {
        room.members().into_iter().map(|m| m.id).collect()
    }

    async fn raw_peer(hub: &LoopbackHub, id: &str, target: &PeerIdentity) -> TransportSession {
        let config = SessionConfig::default();
        let (transport, events) = hub.connector().open(&config).await.unwrap();
        let mut session = TransportSession::new(transport, events, config.signaling_probe_timeout());
        session.initialize(Some(id.into())).await.unwrap();
        session.connect(target).await.unwrap();
        session
    }

    fn encode(frame: &RoomFrame) -> Bytes {
        Bytes::from(CborFrameCodec.encode(frame).unwrap())
    }

    #[tokio::test]
    async fn joiner_appears_in_host_membership() {
        let hub = LoopbackHub::new();
        let (mut host, host_events) = room(&hub, RoomConfig::host(code("12345"), "Ana"));
        let (mut joiner, joiner_events) = room(&hub, RoomConfig::joiner(code("12345"), "Bob"));

        let host_id = host.join().await.unwrap();
        assert_eq!(host_id.as_str(), "12345");
        assert_eq!(ids(&host), vec![host_id.clone()]);

        let joiner_id = joiner.join().await.unwrap();
        settle(&mut [&mut host, &mut joiner]);

        assert_eq!(host.members().len(), 2);
        assert_eq!(
            host_events.joins(),
            vec![(joiner_id.clone(), "Bob".to_owned())]
        );
        assert_eq!(joiner_events.joins(), vec![(host_id, "Ana".to_owned())]);
        assert_eq!(host.state(), SessionState::Connected);
        assert_eq!(joiner.state(), SessionState::Connected);
        assert!(host.controller().deadline().is_none());
    }

    #[tokio::test]
    async fn third_peer_learns_everyone() {
        let hub = LoopbackHub::new();
        let (mut host, _) = room(&hub, RoomConfig::host(code("777"), "Host"));
        let (mut a, a_events) = room(&hub, RoomConfig::joiner(code("777"), "A"));
        let (mut b, b_events) = room(&hub, RoomConfig::joiner(code("777"), "B"));

        host.join().await.unwrap();
        a.join().await.unwrap();
        settle(&mut [&mut host, &mut a]);
        let b_id = b.join().await.unwrap();
        settle(&mut [&mut host, &mut a, &mut b]);

        assert_eq!(host.members().len(), 3);
        assert_eq!(a.members().len(), 3);
        assert_eq!(b.members().len(), 3);
        assert_eq!(a_events.joins().iter().filter(|(id, _)| *id == b_id).count(), 1);
        let b_heard: Vec<_> = b_events.joins().into_iter().map(|(_, n)| n).collect();
        assert!(b_heard.contains(&"A".to_owned()));
        assert!(b_heard.contains(&"Host".to_owned()));
    }

    #[tokio::test]
    async fn chat_reaches_peer_with_sequence() {
        let hub = LoopbackHub::new();
        let (mut host, _) = room(&hub, RoomConfig::host(code("1"), "Ana"));
        let (mut joiner, joiner_events) = room(&hub, RoomConfig::joiner(code("1"), "Bob"));
        let host_id = host.join().await.unwrap();
        joiner.join().await.unwrap();
        settle(&mut [&mut host, &mut joiner]);

        let first = host.send_message("hi");
        let second = host.send_message("again");
        settle(&mut [&mut host, &mut joiner]);

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        let received = joiner_events.messages();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0.content, "hi");
        assert_eq!(received[0].0.sender, "Ana");
        assert_eq!(received[0].0.sequence, 1);
        assert_eq!(received[0].1, host_id);
    }

    #[tokio::test]
    async fn send_without_peers_still_echoes() {
        let hub = LoopbackHub::new();
        let (mut host, _) = room(&hub, RoomConfig::host(code("1"), "Ana"));
        host.join().await.unwrap();
        let message = host.send_message("anyone?");
        assert_eq!(message.sequence, 1);
        assert_eq!(message.content, "anyone?");
    }

    #[tokio::test]
    async fn sequence_restarts_on_fresh_join() {
        let hub = LoopbackHub::new();
        let (mut host, _) = room(&hub, RoomConfig::host(code("1"), "Ana"));
        host.join().await.unwrap();
        host.send_message("a");
        host.send_message("b");
        host.leave().await;
        host.join().await.unwrap();
        assert_eq!(host.send_message("c").sequence, 1);
    }

    #[tokio::test]
    async fn closed_channel_removes_member_once() {
        let hub = LoopbackHub::new();
        let (mut host, host_events) = room(&hub, RoomConfig::host(code("9"), "Ana"));
        let (mut joiner, joiner_events) = room(&hub, RoomConfig::joiner(code("9"), "Bob"));
        let host_id = host.join().await.unwrap();
        let joiner_id = joiner.join().await.unwrap();
        settle(&mut [&mut host, &mut joiner]);

        hub.sever(&host_id, &joiner_id);
        settle(&mut [&mut host, &mut joiner]);

        assert_eq!(joiner_events.leaves(), vec![host_id]);
        assert_eq!(host_events.leaves(), vec![joiner_id.clone()]);
        assert_eq!(ids(&joiner), vec![joiner_id]);
    }

    #[tokio::test]
    async fn closed_channel_is_announced_to_remaining_peers() {
        let hub = LoopbackHub::new();
        let (mut host, _) = room(&hub, RoomConfig::host(code("5"), "Host"));
        let (mut a, _) = room(&hub, RoomConfig::joiner(code("5"), "A"));
        let (mut b, b_events) = room(&hub, RoomConfig::joiner(code("5"), "B"));
        let host_id = host.join().await.unwrap();
        let a_id = a.join().await.unwrap();
        settle(&mut [&mut host, &mut a]);
        b.join().await.unwrap();
        settle(&mut [&mut host, &mut a, &mut b]);

        hub.sever(&host_id, &a_id);
        settle(&mut [&mut host, &mut a, &mut b]);

        assert_eq!(b_events.leaves(), vec![a_id.clone()]);
        assert!(!ids(&b).contains(&a_id));
        assert!(!ids(&host).contains(&a_id));
    }

    #[tokio::test]
    async fn leave_twice_sends_nothing_twice() {
        let hub = LoopbackHub::new();
        let (mut host, host_events) = room(&hub, RoomConfig::host(code("3"), "Ana"));
        let (mut joiner, joiner_events) = room(&hub, RoomConfig::joiner(code("3"), "Bob"));
        let host_id = host.join().await.unwrap();
        joiner.join().await.unwrap();
        settle(&mut [&mut host, &mut joiner]);

        host.leave().await;
        host.leave().await;
        settle(&mut [&mut host, &mut joiner]);

        assert_eq!(hub.teardowns(), 1);
        assert!(host_events.leaves().is_empty());
        assert_eq!(ids(&host), vec![host_id.clone()]);
        assert_eq!(joiner_events.leaves(), vec![host_id]);
        assert_eq!(host.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn malformed_and_self_frames_are_dropped() {
        let hub = LoopbackHub::new();
        let (mut host, host_events) = room(&hub, RoomConfig::host(code("4"), "Ana"));
        let host_id = host.join().await.unwrap();
        let peer = raw_peer(&hub, "raw", &host_id).await;
        host.process_pending();
        host_events.clear();

        assert!(peer.send(&host_id, Bytes::from_static(b"\xff\x00not cbor")));
        assert!(peer.send(
            &host_id,
            encode(&RoomFrame::Join {
                user: RoomMember::new(host_id.clone(), "Impostor"),
            })
        ));
        assert!(peer.send(
            &host_id,
            encode(&RoomFrame::Leave {
                user_id: host_id.clone(),
            })
        ));
        host.process_pending();

        assert!(host_events.all().is_empty());
        assert_eq!(host.members(), vec![RoomMember::new(host_id, "Ana")]);
        assert_eq!(host.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn duplicate_join_is_absorbed_and_rename_is_applied() {
        let hub = LoopbackHub::new();
        let (mut host, host_events) = room(&hub, RoomConfig::host(code("4"), "Ana"));
        let host_id = host.join().await.unwrap();
        let peer = raw_peer(&hub, "raw", &host_id).await;
        host.process_pending();

        let join = |name: &str| {
            encode(&RoomFrame::Join {
                user: RoomMember::new("raw".into(), name),
            })
        };
        peer.send(&host_id, join("Zed"));
        peer.send(&host_id, join("Zed"));
        peer.send(&host_id, join("Zoe"));
        host.process_pending();

        assert_eq!(
            host_events.joins(),
            vec![
                (PeerIdentity::from("raw"), "Zed".to_owned()),
                (PeerIdentity::from("raw"), "Zoe".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn user_list_never_overwrites() {
        let hub = LoopbackHub::new();
        let (mut host, host_events) = room(&hub, RoomConfig::host(code("4"), "Ana"));
        let host_id = host.join().await.unwrap();
        let peer = raw_peer(&hub, "raw", &host_id).await;
        host.process_pending();

        peer.send(
            &host_id,
            encode(&RoomFrame::Join {
                user: RoomMember::new("x".into(), "Xavier"),
            }),
        );
        peer.send(
            &host_id,
            encode(&RoomFrame::UserList {
                users: vec![
                    RoomMember::new("x".into(), "Renamed"),
                    RoomMember::new("y".into(), "Yara"),
                    RoomMember::new(host_id.clone(), "Impostor"),
                ],
            }),
        );
        host.process_pending();

        let names: Vec<_> = host.members().into_iter().map(|m| m.display_name).collect();
        assert_eq!(names, vec!["Ana", "Xavier", "Yara"]);
        assert_eq!(host_events.joins().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lonely_host_times_out() {
        let hub = LoopbackHub::new();
        let (mut host, events) = room(&hub, RoomConfig::host(code("12345"), "Ana"));
        host.join().await.unwrap();

        let started = Instant::now();
        let err = host.run().await;
        assert_eq!(err, SessionError::ConnectionTimeout { role: Role::Host });
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(host.state(), SessionState::Failed);
        assert_eq!(events.errors(), vec![ErrorKind::ConnectionTimeout]);
        assert!(!hub.is_registered(&"12345".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_arrival_cancels_host_timeout() {
        let hub = LoopbackHub::new();
        let (mut host, events) = room(&hub, RoomConfig::host(code("12345"), "Ana"));
        let (mut joiner, _) = room(&hub, RoomConfig::joiner(code("12345"), "Bob"));
        host.join().await.unwrap();
        joiner.join().await.unwrap();
        settle(&mut [&mut host, &mut joiner]);

        let outcome = tokio::time::timeout(Duration::from_secs(120), host.run()).await;
        assert!(outcome.is_err(), "host run ended early: {outcome:?}");
        assert!(events.errors().is_empty());
        assert_eq!(host.members().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_restores_dropped_signaling() {
        let hub = LoopbackHub::new();
        let (mut host, _) = room(&hub, RoomConfig::host(code("12345"), "Ana"));
        let host_id = host.join().await.unwrap();

        hub.drop_signaling(&host_id);
        host.step().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(hub.reconnects(&host_id), 1);
    }

    #[tokio::test]
    async fn retry_after_missing_host() {
        let hub = LoopbackHub::new();
        let (mut joiner, events) = room(&hub, RoomConfig::joiner(code("42"), "Bob"));
        let err = joiner.join().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerUnavailable);
        assert_eq!(joiner.state(), SessionState::Failed);
        let first_id = joiner.local_identity().clone();

        let (mut host, _) = room(&hub, RoomConfig::host(code("42"), "Ana"));
        host.join().await.unwrap();
        let id = joiner.reset_and_retry().await.unwrap();
        settle(&mut [&mut host, &mut joiner]);

        assert_eq!(id, first_id);
        assert_eq!(joiner.state(), SessionState::Connected);
        assert_eq!(joiner.members().len(), 2);
        assert_eq!(events.errors(), vec![ErrorKind::PeerUnavailable]);
    }

    #[tokio::test]
    async fn reset_drops_remote_members() {
        let hub = LoopbackHub::new();
        let (mut host, _) = room(&hub, RoomConfig::host(code("42"), "Ana"));
        let (mut joiner, events) = room(&hub, RoomConfig::joiner(code("42"), "Bob"));
        let host_id = host.join().await.unwrap();
        joiner.join().await.unwrap();
        settle(&mut [&mut host, &mut joiner]);

        host.leave().await;
        joiner.reset_and_retry().await.unwrap_err();
        assert_eq!(events.leaves(), vec![host_id]);
        assert_eq!(joiner.members().len(), 1);
    }

    #[tokio::test]
    async fn host_restart_opens_new_room() {
        let hub = LoopbackHub::new();
        let (mut host, _) = room(&hub, RoomConfig::host(code("11111"), "Ana"));
        let old = host.join().await.unwrap();

        let new = host.restart().await.unwrap();
        assert_ne!(old, new);
        assert_ne!(host.room_code().as_str(), "11111");
        assert_eq!(host.host_identity(), &new);
        assert!(!hub.is_registered(&old));
        assert!(hub.is_registered(&new));
        assert_eq!(ids(&host), vec![new]);
    }

    #[tokio::test]
    async fn joiner_restart_draws_new_identity() {
        let hub = LoopbackHub::new();
        let (mut host, _) = room(&hub, RoomConfig::host(code("8"), "Ana"));
        let (mut joiner, _) = room(&hub, RoomConfig::joiner(code("8"), "Bob"));
        host.join().await.unwrap();
        let old = joiner.join().await.unwrap();

        let new = joiner.restart().await.unwrap();
        assert_ne!(old, new);
        settle(&mut [&mut host, &mut joiner]);
        assert!(ids(&host).contains(&new));
        assert!(!ids(&host).contains(&old));
    }
}
