//! Live sessions indexed by id and by public port

use crate::error::SessionError;
use crate::session::{CloseReason, Session};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Every active session of a relay; at most one session per public port
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<Session>>,
    ports: DashMap<u16, Uuid>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) -> Result<(), SessionError> {
        match self.ports.entry(session.port()) {
            Entry::Occupied(entry) => Err(SessionError::PortConflict(format!(
                "port {} belongs to session {}",
                session.port(),
                entry.get()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(session.id());
                debug!(
                    "Registered session {} on port {}",
                    session.id(),
                    session.port()
                );
                self.sessions.insert(session.id(), session);
                Ok(())
            }
        }
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        self.ports.remove_if(&session.port(), |_, owner| owner == id);
        debug!("Unregistered session {}", id);
        Some(session)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn by_port(&self, port: u16) -> Option<Arc<Session>> {
        let id = *self.ports.get(&port)?.value();
        self.get(&id)
    }

    pub fn is_port_reserved(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn sessions_for_key(&self, key: &str) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.value().key().name() == key)
            .count()
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session; returns how many were still open
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let closed = self
            .list()
            .into_iter()
            .filter(|session| session.close(reason))
            .count();
        if closed > 0 {
            info!("Closed {} sessions: {}", closed, reason);
        }
        closed
    }
}
