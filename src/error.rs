//! Error types for the relay server
//!
//! One enum per concern, all built with thiserror:
//! - `ConfigError`: invalid settings (fatal before bind)
//! - `ProtocolError`: malformed frames (closes the offending session only)
//! - `RegistryError`: rejected registry updates (reported back to the client)
//! - `SendError`: delivery to a closed or backed-up session
//! - `ServerError`: top-level controller errors

use std::net::SocketAddr;

use thiserror::Error;

use crate::types::{ClientId, ServerState};

/// Invalid configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Host is not a dotted-quad IPv4 literal
    #[error("invalid host '{0}': expected a dotted-quad IPv4 address")]
    InvalidHost(String),

    /// Port outside 1..=65535
    #[error("invalid port {0}: expected 1..=65535")]
    InvalidPort(u16),

    /// max_users outside 1..=100
    #[error("invalid max_users {0}: expected 1..=100")]
    InvalidMaxUsers(usize),

    /// buff_size outside 1024..=2^20
    #[error("invalid buff_size {0}: expected 1024..=1048576")]
    InvalidBuffSize(usize),

    /// history_size above the log limit
    #[error("invalid history_size {0}: expected 0..=10000")]
    InvalidHistorySize(usize),

    /// Encoding name not recognized
    #[error("unknown encoding '{0}'")]
    UnknownEncoding(String),

    /// Encoding does not round-trip plain ASCII text
    #[error("encoding '{0}' does not round-trip a test string")]
    EncodingRoundTrip(String),

    /// Error policy not recognized or not allowed
    #[error("unsupported encoding error policy '{0}'")]
    UnknownErrorPolicy(String),

    /// Config file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for `Config`
    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Malformed or unrecognized client frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Header token outside the command vocabulary
    #[error("unknown header '{0}'")]
    UnknownHeader(String),

    /// Bytes accumulated without a line terminator beyond the read buffer size
    #[error("frame exceeds {0} bytes without a line terminator")]
    FrameTooLong(usize),

    /// Payload contains `\n` or `\r` and cannot be sent as a single line
    #[error("payload contains a line terminator")]
    EmbeddedLineTerminator,
}

/// Registry update rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Username is first-write-wins
    #[error("username already set for client {0}")]
    AlreadySet(ClientId),

    /// Target session is not registered
    #[error("no such user: {0}")]
    NoSuchUser(ClientId),
}

/// Message send errors
///
/// Occurs when attempting to deliver to a session whose writer has stopped.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The outbound queue is full; the client is not draining it
    #[error("Outbound queue full")]
    QueueFull,
}

/// Server controller errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Settings rejected before bind
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// IO error on the listening socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted in the wrong lifecycle state
    #[error("invalid server state: expected {expected}, found {actual}")]
    InvalidState {
        expected: ServerState,
        actual: ServerState,
    },
}
