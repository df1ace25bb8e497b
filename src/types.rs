//! Basic type definitions for the relay server
//!
//! Provides:
//! - `ClientId`: monotonically assigned session identifier
//! - `ServerState`: lifecycle of the server controller

use std::num::ParseIntError;
use std::str::FromStr;

/// Unique client identifier (newtype pattern)
///
/// Assigned by the registry in accept order, starting at 0.
/// Ordering follows assignment order, which keeps `USERS` listings stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Server controller lifecycle
///
/// Transitions only move forward:
/// `Created -> Listening -> Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    /// Config validated, no socket bound
    Created,
    /// Listening socket bound
    Listening,
    /// Accept loop running
    Open,
    /// Shutdown requested, sessions being closed
    Closing,
    /// Terminal state
    Closed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Created => "created",
            ServerState::Listening => "listening",
            ServerState::Open => "open",
            ServerState::Closing => "closing",
            ServerState::Closed => "closed",
        };
        f.write_str(name)
    }
}
