//! Client registry
//!
//! The shared table of active sessions and the ban list, behind a single
//! mutex. The lock is only held to read or update the table; callers take a
//! `snapshot` and deliver messages after the lock is released, so no network
//! write ever happens while it is held.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::RegistryError;
use crate::session::{Connection, Session};
use crate::types::ClientId;

#[derive(Debug, Default)]
struct Inner {
    /// Next id to hand out
    next_id: u64,
    /// Active sessions; ids are assigned in order so this is insertion order
    sessions: BTreeMap<ClientId, Session>,
    /// Remote IPs refused at accept
    banned: HashSet<IpAddr>,
}

/// Thread-safe table of active sessions
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // no invariant can be half-applied under this lock, so a poisoned
        // guard is still consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new session and return its id
    pub fn register(&self, addr: SocketAddr, connection: Connection) -> ClientId {
        let mut inner = self.lock();
        let id = ClientId(inner.next_id);
        inner.next_id += 1;
        inner.sessions.insert(id, Session::new(id, addr, connection));
        debug!("Registered client {} ({} active)", id, inner.sessions.len());
        id
    }

    /// Remove a session, returning it if it was present
    ///
    /// Absent ids are a no-op so disconnect and kick can race safely.
    pub fn unregister(&self, id: ClientId) -> Option<Session> {
        let mut inner = self.lock();
        let removed = inner.sessions.remove(&id);
        if removed.is_some() {
            debug!("Unregistered client {} ({} active)", id, inner.sessions.len());
        }
        removed
    }

    /// Remove a session and refuse future connections from its IP
    pub fn ban(&self, id: ClientId) -> Option<Session> {
        let mut inner = self.lock();
        let removed = inner.sessions.remove(&id)?;
        inner.banned.insert(removed.addr.ip());
        Some(removed)
    }

    /// Whether connections from `ip` are refused
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.lock().banned.contains(&ip)
    }

    /// Look up a session by id
    pub fn get(&self, id: ClientId) -> Option<Session> {
        self.lock().sessions.get(&id).cloned()
    }

    /// Copy of current membership, in id order
    pub fn snapshot(&self) -> Vec<Session> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Set a session's username (first write wins)
    pub fn set_username(&self, id: ClientId, name: String) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::NoSuchUser(id))?;
        if session.username.is_some() {
            return Err(RegistryError::AlreadySet(id));
        }
        session.username = Some(name);
        Ok(())
    }

    /// Remove every session, in id order (used at shutdown)
    pub fn drain(&self) -> Vec<Session> {
        let mut inner = self.lock();
        std::mem::take(&mut inner.sessions).into_values().collect()
    }

    /// Number of active sessions
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Check if no sessions are active
    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }
}
