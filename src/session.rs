//! Session and connection handles
//!
//! A `Session` is the registry's view of one connected client. Its
//! `Connection` is the only way other tasks reach that client: queueing a
//! reply for the writer task, or asking the session to close.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::error::SendError;
use crate::message::{ServerMessage, ANONYMOUS};
use crate::types::ClientId;

/// Per-session outbound queue depth
pub const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Shared handle to one client's connection
///
/// Cloning is cheap; every clone talks to the same writer task and the same
/// close signal.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Server -> client message channel
    sender: mpsc::Sender<ServerMessage>,
    /// Close reason, `None` while open
    close_tx: Arc<watch::Sender<Option<String>>>,
}

/// Receiving ends owned by the session's own tasks
#[derive(Debug)]
pub struct ConnectionEndpoints {
    /// Drained by the writer task
    pub outbound: mpsc::Receiver<ServerMessage>,
    /// Observed by both the read loop and the writer task
    pub closed: watch::Receiver<Option<String>>,
}

impl Connection {
    /// Create a connection handle and the endpoints for its tasks
    pub fn new(buffer: usize) -> (Self, ConnectionEndpoints) {
        let (sender, outbound) = mpsc::channel(buffer);
        let (close_tx, closed) = watch::channel(None);
        let connection = Self {
            sender,
            close_tx: Arc::new(close_tx),
        };
        (connection, ConnectionEndpoints { outbound, closed })
    }

    /// Queue a message for this client
    ///
    /// Returns an error if the writer has stopped (client disconnected).
    pub async fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Queue a message without waiting for room
    ///
    /// Used for deliveries on behalf of another session, so a client that
    /// stops reading only loses its own messages.
    pub fn try_send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Ask the session to close
    ///
    /// Idempotent: the first reason wins and later calls return `false`.
    /// Unblocks a pending read in the session's handler.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.close_tx.borrow().is_some()
    }
}

/// Connected client information held in the registry
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique identifier for this client
    pub id: ClientId,
    /// Remote address, consulted by `BAN`
    pub addr: SocketAddr,
    /// Username (None before `USERNAME`)
    pub username: Option<String>,
    /// Delivery and close handle
    pub connection: Connection,
}

impl Session {
    pub fn new(id: ClientId, addr: SocketAddr, connection: Connection) -> Self {
        Self {
            id,
            addr,
            username: None,
            connection,
        }
    }

    /// Get the display name for this client
    ///
    /// Returns the username if set, otherwise "anonymous".
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or(ANONYMOUS)
    }

    /// Deliver a message from another session without blocking
    pub fn deliver(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.connection.try_send(msg)
    }
}
