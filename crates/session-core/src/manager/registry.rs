//! Session Registry
//!
//! Every live session of this node, the participants that joined it (by
//! public id) and the tokens issued for it. The three maps are created and
//! pruned together: a session id is either present in all of them or in none.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::api::types::{SessionId, Token};
use crate::errors::{Result, SessionError};
use crate::session::{MediaSession, Participant};

/// Registry of sessions, their participants and their tokens
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<MediaSession>>,
    /// session id -> public id -> participant
    participants: DashMap<SessionId, DashMap<String, Arc<Participant>>>,
    /// session id -> token id -> token
    tokens: DashMap<SessionId, DashMap<String, Token>>,
    /// Held while a session is added or pruned
    lifecycle: Mutex<()>,
    stats: Mutex<SessionRegistryStats>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionRegistryStats {
    pub total_created: usize,
    pub total_removed: usize,
    pub rejected_duplicates: usize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            participants: DashMap::new(),
            tokens: DashMap::new(),
            lifecycle: Mutex::new(()),
            stats: Mutex::new(SessionRegistryStats::default()),
        }
    }

    /// Register a session. A second registration of the same id fails.
    pub fn insert_session(&self, session: Arc<MediaSession>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let session_id = session.session_id().clone();
        if self.sessions.contains_key(&session_id) {
            self.stats.lock().rejected_duplicates += 1;
            return Err(SessionError::session_already_exists(session_id.as_str()));
        }
        self.participants.insert(session_id.clone(), DashMap::new());
        self.tokens.insert(session_id.clone(), DashMap::new());
        self.sessions.insert(session_id.clone(), session);
        self.stats.lock().total_created += 1;

        tracing::debug!("Registered session: {}", session_id);
        Ok(())
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<Arc<MediaSession>> {
        self.find_session(session_id)
            .ok_or_else(|| SessionError::session_not_found(session_id.as_str()))
    }

    pub fn find_session(&self, session_id: &SessionId) -> Option<Arc<MediaSession>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    pub fn contains_session(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove the session together with its participants and tokens
    pub fn remove_session(&self, session_id: &SessionId) -> Option<Arc<MediaSession>> {
        let _lifecycle = self.lifecycle.lock();
        let removed = self.sessions.remove(session_id).map(|(_, s)| s);
        self.participants.remove(session_id);
        self.tokens.remove(session_id);
        if removed.is_some() {
            self.stats.lock().total_removed += 1;
            tracing::debug!("Removed session: {}", session_id);
        }
        removed
    }

    pub fn add_participant(&self, session_id: &SessionId, participant: Arc<Participant>) -> Result<()> {
        let roster = self
            .participants
            .get(session_id)
            .ok_or_else(|| SessionError::session_not_found(session_id.as_str()))?;
        roster.insert(participant.public_id().to_string(), participant);
        Ok(())
    }

    /// Forget a participant and the token it joined with
    pub fn remove_participant(&self, session_id: &SessionId, public_id: &str) -> Option<Arc<Participant>> {
        let removed = self
            .participants
            .get(session_id)
            .and_then(|roster| roster.remove(public_id).map(|(_, p)| p));
        if let Some(participant) = &removed {
            self.remove_token(session_id, participant.token());
            tracing::debug!("Unregistered participant {} from session {}", public_id, session_id);
        }
        removed
    }

    pub fn participant(&self, session_id: &SessionId, public_id: &str) -> Option<Arc<Participant>> {
        self.participants
            .get(session_id)
            .and_then(|roster| roster.get(public_id).map(|p| Arc::clone(p.value())))
    }

    pub fn participants(&self, session_id: &SessionId) -> Vec<Arc<Participant>> {
        self.participants
            .get(session_id)
            .map(|roster| roster.iter().map(|p| Arc::clone(p.value())).collect())
            .unwrap_or_default()
    }

    /// Look a connection up by private id across every session
    pub fn participant_by_private_id(&self, private_id: &str) -> Option<Arc<Participant>> {
        self.participants.iter().find_map(|roster| {
            roster
                .iter()
                .find(|p| p.value().private_id() == private_id)
                .map(|p| Arc::clone(p.value()))
        })
    }

    pub fn add_token(&self, session_id: &SessionId, token: Token) -> Result<()> {
        let tokens = self
            .tokens
            .get(session_id)
            .ok_or_else(|| SessionError::session_not_found(session_id.as_str()))?;
        tokens.insert(token.token.clone(), token);
        Ok(())
    }

    pub fn token(&self, session_id: &SessionId, token_id: &str) -> Option<Token> {
        self.tokens
            .get(session_id)
            .and_then(|tokens| tokens.get(token_id).map(|t| t.value().clone()))
    }

    pub fn remove_token(&self, session_id: &SessionId, token_id: &str) -> Option<Token> {
        self.tokens
            .get(session_id)
            .and_then(|tokens| tokens.remove(token_id).map(|(_, t)| t))
    }

    pub fn token_count(&self, session_id: &SessionId) -> usize {
        self.tokens.get(session_id).map(|t| t.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> SessionRegistryStats {
        *self.stats.lock()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("stats", &self.stats())
            .finish()
    }
}
