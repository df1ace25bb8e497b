//! Server controller
//!
//! Owns the listening socket, the accept loop and the registry. Lifecycle:
//!
//! ```text
//! Created --bind--> Listening --run--> Open --KILL / stop--> Closing --> Closed
//! ```
//!
//! Shutdown is a `watch` flag shared with the dispatcher (`KILL`) and with
//! every `ServerHandle` (external stop). The accept loop selects on it, so a
//! pending `accept` never delays shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::handler::handle_connection;
use crate::message::{ErrorCode, ServerMessage};
use crate::registry::Registry;
use crate::session::{Connection, OUTBOUND_BUFFER_SIZE};
use crate::types::ServerState;

/// How long shutdown waits for session tasks before aborting them
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long a refused peer gets to take its `ERROR` line
const REJECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cloneable control handle for a running server
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ServerState>,
}

impl ServerHandle {
    /// Request an orderly shutdown (same path as `KILL`)
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Wait until the server reaches `target` (or any later state)
    pub async fn wait_for(&self, target: ServerState) {
        let mut state = self.state.clone();
        // the sender lives as long as the server; if it is gone we are closed
        let _ = state.wait_for(|s| *s >= target).await;
    }
}

/// The relay server
pub struct ChatServer {
    config: Config,
    registry: Arc<Registry>,
    listener: Option<TcpListener>,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Sender<ServerState>,
}

impl ChatServer {
    /// Validate the config and create a server in the `Created` state
    pub fn new(config: Config) -> Result<Self, ServerError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let (state, _) = watch::channel(ServerState::Created);
        Ok(Self {
            config,
            registry: Arc::new(Registry::new()),
            listener: None,
            shutdown: Arc::new(shutdown),
            state,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Address of the bound listening socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind the listening socket with a backlog of `max_users`
    pub fn bind(&mut self) -> Result<SocketAddr, ServerError> {
        self.expect_state(ServerState::Created)?;

        let addr = self.config.bind_addr()?;
        let listener = listen(addr, self.config.max_users)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        self.listener = Some(listener);
        self.set_state(ServerState::Listening);
        info!("Listening on {}", local);
        Ok(local)
    }

    /// Run the accept loop until shutdown, then close every session
    ///
    /// Binds first if `bind` has not been called.
    pub async fn run(mut self) -> Result<(), ServerError> {
        if self.state() == ServerState::Created {
            self.bind()?;
        }
        self.expect_state(ServerState::Listening)?;
        let Some(listener) = self.listener.take() else {
            return Err(ServerError::InvalidState {
                expected: ServerState::Listening,
                actual: self.state(),
            });
        };

        let dispatcher = Arc::new(Dispatcher::new(
            self.config.clone(),
            self.registry.clone(),
            self.shutdown.clone(),
        ));
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        self.set_state(ServerState::Open);
        info!(
            "Server open (max_users={}, buff_size={}, encoding={}/{})",
            self.config.max_users,
            self.config.buff_size,
            self.config.encoding,
            self.config.encoding_errors
        );

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(&dispatcher, &mut sessions, stream, addr),
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        self.set_state(ServerState::Closing);
        info!("Server closing");

        // stop accepting before touching sessions
        drop(listener);

        let active = self.registry.drain();
        info!("Closing {} active sessions", active.len());
        for session in active {
            session.connection.close("server shutting down");
        }

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = sessions.join_next().await {
                if let Err(e) = joined {
                    error!("Session task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Sessions still running after {:?}, aborting", SHUTDOWN_GRACE);
            sessions.shutdown().await;
        }

        self.set_state(ServerState::Closed);
        info!("Server closed");
        Ok(())
    }

    /// Register an accepted connection and start its handler
    ///
    /// Refusals are written from their own task so the accept loop never
    /// waits on a refused peer.
    fn admit(
        &self,
        dispatcher: &Arc<Dispatcher>,
        sessions: &mut JoinSet<()>,
        stream: TcpStream,
        addr: SocketAddr,
    ) {
        if self.registry.is_banned(addr.ip()) {
            info!("Rejected banned address {}", addr);
            sessions.spawn(reject(
                stream,
                self.refusal(ErrorCode::Banned, "your address is banned"),
            ));
            return;
        }
        if self.registry.len() >= self.config.max_users {
            info!("Rejected {}: server full", addr);
            sessions.spawn(reject(
                stream,
                self.refusal(ErrorCode::ServerFull, "server is full"),
            ));
            return;
        }

        let (connection, endpoints) = Connection::new(OUTBOUND_BUFFER_SIZE);
        let id = self.registry.register(addr, connection.clone());
        debug!("Accepted {} as client {}", addr, id);
        sessions.spawn(handle_connection(
            dispatcher.clone(),
            stream,
            id,
            addr,
            connection,
            endpoints,
        ));
    }

    fn refusal(&self, code: ErrorCode, message: &str) -> Vec<u8> {
        self.config
            .codec()
            .encode_message(&ServerMessage::error(code, message))
    }

    fn expect_state(&self, expected: ServerState) -> Result<(), ServerError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(ServerError::InvalidState { expected, actual })
        }
    }

    fn set_state(&self, state: ServerState) {
        debug!("Server state -> {}", state);
        self.state.send_replace(state);
    }
}

/// Tell a refused peer why, then drop the connection
async fn reject(mut stream: TcpStream, bytes: Vec<u8>) {
    let written = tokio::time::timeout(REJECT_TIMEOUT, async {
        stream.write_all(&bytes).await?;
        stream.shutdown().await
    })
    .await;
    if !matches!(written, Ok(Ok(()))) {
        debug!("Could not notify rejected peer");
    }
}

fn listen(addr: SocketAddr, backlog: usize) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    // backlog is validated to 1..=100
    socket.listen(backlog as u32)
}
