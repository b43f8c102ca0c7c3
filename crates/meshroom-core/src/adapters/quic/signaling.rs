//! Quinn-based signaling server.
//!
//! Keeps the registry of live identities and the address each one was
//! observed from. Clients hold one connection with one bidirectional control
//! stream; a registration lives exactly as long as that connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quinn::{Connection, Endpoint, RecvStream, SendStream};
use tracing::{debug, info, warn};

use crate::domain::identity::PeerIdentity;

use super::codec::{read_msg, write_msg, SignalMsg};
use super::tls;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Registration {
    conn_id: u64,
    addr: SocketAddr,
    /// `None` only in unit tests.
    connection: Option<Connection>,
}

impl Registration {
    fn is_stale(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.close_reason().is_some())
    }
}

/// Identity → observed address, owned by connection id.
#[derive(Default)]
struct Registry {
    entries: HashMap<PeerIdentity, Registration>,
}

impl Registry {
    /// Claim `requested` (or a fresh id) for `conn_id`. Returns the taken
    /// identity as the error on collision.
    fn register(
        &mut self,
        requested: Option<PeerIdentity>,
        conn_id: u64,
        addr: SocketAddr,
        connection: Option<Connection>,
    ) -> Result<PeerIdentity, PeerIdentity> {
        let id = requested.unwrap_or_else(|| PeerIdentity::ephemeral("peer-"));
        if let Some(existing) = self.entries.get(&id) {
            if existing.conn_id != conn_id && !existing.is_stale() {
                return Err(id);
            }
        }
        self.entries.insert(
            id.clone(),
            Registration {
                conn_id,
                addr,
                connection,
            },
        );
        Ok(id)
    }

    fn resolve(&self, id: &PeerIdentity) -> Option<SocketAddr> {
        self.entries
            .get(id)
            .filter(|r| !r.is_stale())
            .map(|r| r.addr)
    }

    /// Drop everything `conn_id` registered; returns the released ids.
    fn release(&mut self, conn_id: u64) -> Vec<PeerIdentity> {
        let released: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, r)| r.conn_id == conn_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &released {
            self.entries.remove(id);
        }
        released
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Signaling server
// ---------------------------------------------------------------------------

pub struct SignalingServer {
    endpoint: Endpoint,
    registry: Arc<Mutex<Registry>>,
    next_conn_id: AtomicU64,
}

impl SignalingServer {
    /// Create and bind the server.
    pub fn bind(bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let server_config = tls::self_signed_server_config()?;
        let endpoint = Endpoint::server(server_config, bind_addr)?;
        info!(addr = %endpoint.local_addr()?, "Signaling server listening");

        Ok(Self {
            endpoint,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Stop accepting and close every client connection.
    pub fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }

    /// Run the accept loop until the endpoint is closed.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        while let Some(incoming) = self.endpoint.accept().await {
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => server.handle_connection(conn).await,
                    Err(e) => warn!("Failed to accept connection: {e}"),
                }
            });
        }
        info!("Signaling server stopped");
        Ok(())
    }

    async fn handle_connection(&self, connection: Connection) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let addr = connection.remote_address();
        debug!(conn_id, %addr, "Client connected");

        let result = match connection.accept_bi().await {
            Ok((mut send, mut recv)) => {
                self.control_loop(&connection, conn_id, &mut send, &mut recv)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            debug!(conn_id, "Control stream ended: {e}");
        }

        let released = self.registry.lock().unwrap().release(conn_id);
        for id in released {
            info!(peer = %id, "Identity released");
        }
        connection.close(0u32.into(), b"bye");
    }

    async fn control_loop(
        &self,
        connection: &Connection,
        conn_id: u64,
        send: &mut SendStream,
        recv: &mut RecvStream,
    ) -> anyhow::Result<()> {
        let addr = connection.remote_address();
        loop {
            let request: SignalMsg = read_msg(recv).await?;
            let response = match request {
                SignalMsg::Register { requested } => {
                    let outcome = self.registry.lock().unwrap().register(
                        requested,
                        conn_id,
                        addr,
                        Some(connection.clone()),
                    );
                    match outcome {
                        Ok(id) => {
                            info!(peer = %id, %addr, "Identity registered");
                            SignalMsg::Registered { id, observed: addr }
                        }
                        Err(id) => {
                            debug!(peer = %id, "Identity already taken");
                            SignalMsg::IdTaken { id }
                        }
                    }
                }
                SignalMsg::Resolve { id } => {
                    let resolved = self.registry.lock().unwrap().resolve(&id);
                    debug!(peer = %id, addr = ?resolved, "Resolve");
                    SignalMsg::Resolved { id, addr: resolved }
                }
                other => SignalMsg::Rejected {
                    reason: format!("unexpected request {other:?}"),
                },
            };
            write_msg(send, &response).await?;
        }
    }
}
