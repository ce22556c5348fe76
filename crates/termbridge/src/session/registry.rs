//! Concurrent map of live sessions keyed by connection.
//!
//! Removal is the single claim point for teardown: whichever caller gets the
//! `Session` back from [`SessionRegistry::remove`] owns its cleanup, so
//! concurrent teardowns of the same connection cannot double-kill or
//! double-close.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::handle::{Session, SessionHandle, SessionInfo};
use super::ConnectionId;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session under its connection id.
    ///
    /// A connection has at most one session; a duplicate is handed back
    /// untouched so the caller can dispose of it.
    pub fn insert(&self, session: Session) -> Result<(), Session> {
        match self.sessions.entry(session.id()) {
            Entry::Occupied(_) => Err(session),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.handle())
    }

    /// Claims a session for teardown.
    pub fn remove(&self, id: &ConnectionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.info()).collect()
    }

    /// Claims every session currently registered.
    pub fn drain(&self) -> Vec<Session> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect()
    }
}
