//! Resilience controller: bounded retry, establishment timeouts and
//! signaling liveness on top of a [`TransportSession`].
//!
//! Owns exactly one session per attempt. `reset` tears the current session
//! down (awaited) before building its replacement, so nothing from a previous
//! attempt can leak into the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::domain::identity::PeerIdentity;
use crate::domain::session::{Role, SessionState};
use crate::error::SessionError;

use super::ports::{RoomEvents, TransportConnector};
use super::transport_session::{SessionEvent, TransportSession};

pub struct ResilienceController {
    connector: Arc<dyn TransportConnector>,
    config: SessionConfig,
    role: Role,
    events: Arc<dyn RoomEvents>,
    session: Option<TransportSession>,
    state: SessionState,
    /// Collision retries spent in the current attempt.
    retries: u32,
    /// Host only: when waiting for the first joiner gives up.
    deadline: Option<Instant>,
    /// Set while a spawned signaling reconnect is running.
    reconnecting: Arc<AtomicBool>,
}

impl ResilienceController {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        config: SessionConfig,
        role: Role,
        events: Arc<dyn RoomEvents>,
    ) -> Self {
        Self {
            connector,
            config,
            role,
            events,
            session: None,
            state: SessionState::Disconnected,
            retries: 0,
            deadline: None,
            reconnecting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&TransportSession> {
        self.session.as_ref()
    }

    /// Whether a live (not yet torn down) session exists.
    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Collision retries spent so far in this attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Pending establishment deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Session state change");
            self.state = state;
            self.events.on_state_change(state);
        }
    }

    /// Record a terminal failure: tear the session down, go FAILED, tell the
    /// presentation layer. Returns `err` for propagation.
    async fn fail(&mut self, err: SessionError) -> SessionError {
        warn!(role = %self.role, "Session failed: {err}");
        self.deadline = None;
        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
        }
        self.set_state(SessionState::Failed);
        self.events.on_error(&err);
        err
    }

    // -----------------------------------------------------------------------
    // Establishment
    // -----------------------------------------------------------------------

    /// Build a fresh session unless one is already live.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.is_active() {
            return Ok(());
        }
        if !self.config.relay_servers.is_empty() {
            debug!(relays = ?self.config.relay_servers, "Passing relay servers to transport");
        }
        match self.connector.open(&self.config).await {
            Ok((transport, link_events)) => {
                self.session = Some(TransportSession::new(
                    transport,
                    link_events,
                    self.config.signaling_probe_timeout(),
                ));
                self.retries = 0;
                Ok(())
            }
            Err(e) => Err(self.fail(e.into()).await),
        }
    }

    /// Register `requested`, retrying on identity collisions.
    ///
    /// The host retries its fixed identity unchanged; a joiner draws a fresh
    /// ephemeral identity for every retry. After `identity_retry_ceiling`
    /// retries the next collision is `IdentityExhausted`. On success the host
    /// starts its wait-for-joiner deadline.
    pub async fn initialize(&mut self, requested: PeerIdentity) -> Result<PeerIdentity, SessionError> {
        self.start().await?;
        self.set_state(SessionState::Connecting);

        let ceiling = self.config.identity_retry_ceiling;
        let delay = self.config.identity_retry_delay();
        let mut candidate = requested;

        loop {
            let Some(session) = self.session.as_mut() else {
                return Err(SessionError::Closed);
            };
            match session.initialize(Some(candidate.clone())).await {
                Ok(id) => {
                    info!(local = %id, role = %self.role, retries = self.retries, "Identity acquired");
                    if self.role == Role::Host {
                        // Registered and reachable; the deadline tracks the first joiner.
                        self.deadline = Some(Instant::now() + self.config.connect_timeout(Role::Host));
                        self.set_state(SessionState::Connected);
                    }
                    return Ok(id);
                }
                Err(SessionError::IdentityTaken(taken)) => {
                    if self.retries >= ceiling {
                        let attempts = self.retries + 1;
                        return Err(self
                            .fail(SessionError::IdentityExhausted { attempts })
                            .await);
                    }
                    self.retries += 1;
                    warn!(
                        identity = %taken,
                        retry = self.retries,
                        ceiling,
                        "Identity taken, retrying after {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    if self.role == Role::Joiner {
                        candidate = PeerIdentity::ephemeral(&self.config.identity_namespace);
                    }
                }
                Err(other) => return Err(self.fail(other).await),
            }
        }
    }

    /// Dial `remote` within the joiner establishment timeout.
    pub async fn connect(&mut self, remote: &PeerIdentity) -> Result<(), SessionError> {
        let timeout = self.config.connect_timeout(Role::Joiner);
        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::Closed);
        };
        match tokio::time::timeout(timeout, session.connect(remote)).await {
            Ok(Ok(())) => {
                self.mark_established();
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(e).await),
            Err(_) => Err(self
                .fail(SessionError::ConnectionTimeout { role: Role::Joiner })
                .await),
        }
    }

    /// A channel is up: cancel the pending deadline and report CONNECTED.
    pub fn mark_established(&mut self) {
        if self.deadline.take().is_some() {
            debug!("Establishment deadline cancelled");
        }
        if self.is_active() {
            self.set_state(SessionState::Connected);
        }
    }

    /// The establishment deadline passed without a channel.
    pub async fn expire(&mut self) -> SessionError {
        self.fail(SessionError::ConnectionTimeout { role: self.role })
            .await
    }

    /// The session's event queue ended underneath us.
    pub async fn transport_lost(&mut self) -> SessionError {
        self.fail(SessionError::Network("transport closed".into()))
            .await
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    /// Heartbeat tick: if the signaling link is down, kick off a reconnect in
    /// the background. Channels are not touched.
    pub fn probe_liveness(&self) {
        let Some(session) = self.session.as_ref().filter(|s| !s.is_closed()) else {
            return;
        };
        let transport = session.transport();
        if transport.signaling_connected() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            debug!("Signaling reconnect already in flight");
            return;
        }
        info!("Signaling link down, reconnecting");
        let reconnecting = Arc::clone(&self.reconnecting);
        tokio::spawn(async move {
            match transport.reconnect_signaling().await {
                Ok(()) => info!("Signaling link restored"),
                Err(e) => warn!("Signaling reconnect failed: {e}"),
            }
            reconnecting.store(false, Ordering::Release);
        });
    }

    // -----------------------------------------------------------------------
    // Events + teardown
    // -----------------------------------------------------------------------

    /// Next session event; pends forever while there is no live session.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        match self.session.as_mut() {
            Some(session) if !session.is_closed() => session.next_event().await,
            _ => std::future::pending().await,
        }
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.session.as_mut()?.try_next_event()
    }

    /// Tear the current session down. Idempotent.
    pub async fn teardown(&mut self) {
        self.deadline = None;
        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Tear down and start over with a fresh session and attempt counter.
    pub async fn reset(&mut self) -> Result<(), SessionError> {
        info!(role = %self.role, "Resetting session");
        self.teardown().await;
        self.retries = 0;
        self.start().await
    }
}
