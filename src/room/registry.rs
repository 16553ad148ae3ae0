//! The room's peer map: sole owner of every [`PeerSession`].
//!
//! Sessions live in insertion order, which is also the order the view
//! layout shows them in.

use tracing::{debug, info, warn};

use super::session::PeerSession;
use crate::error::{ConferenceError, Result};

#[derive(Debug, Default)]
pub struct PeerRegistry {
    sessions: Vec<PeerSession>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session. An id that already has a session keeps it; the
    /// newcomer's connection is closed and `DuplicatePeer` returned.
    pub async fn upsert(&mut self, mut session: PeerSession) -> Result<&mut PeerSession> {
        if self.contains(session.id()) {
            warn!(peer_id = session.id(), "Rejecting second session for peer");
            session.close().await;
            return Err(ConferenceError::DuplicatePeer(session.id().to_string()));
        }
        debug!(peer_id = session.id(), "Session registered");
        self.sessions.push(session);
        let last = self.sessions.len() - 1;
        Ok(&mut self.sessions[last])
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerSession> {
        self.sessions.iter().find(|s| s.id() == peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerSession> {
        self.sessions.iter_mut().find(|s| s.id() == peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.get(peer_id).is_some()
    }

    /// Close a session's connection and drop it. Removing an unknown id is a
    /// no-op; returns whether anything was removed.
    pub async fn remove(&mut self, peer_id: &str) -> bool {
        let Some(index) = self.sessions.iter().position(|s| s.id() == peer_id) else {
            return false;
        };
        self.sessions[index].close().await;
        self.sessions.remove(index);
        info!(peer_id, remaining = self.sessions.len(), "Session removed");
        true
    }

    pub fn all(&self) -> &[PeerSession] {
        &self.sessions
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.iter_mut()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session, then clear. Sessions mid-negotiation are closed
    /// like any other.
    pub async fn close_all(&mut self) {
        for session in self.sessions.iter_mut() {
            session.close().await;
        }
        let closed = self.sessions.len();
        self.sessions.clear();
        info!(closed, "All sessions closed");
    }
}
