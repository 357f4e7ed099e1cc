use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use beacon_common::types::UserId;
use tracing::info;

use crate::{
    metrics,
    realtime::session::{CloseReason, Session},
};

/// Process-wide map from user to the one session currently serving them.
///
/// The lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<UserId, Arc<Session>>>,
}

impl ConnectionRegistry {
    /// Install `session` for its user, closing and returning whichever
    /// session it replaces.
    pub fn admit(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let user_id = session.user_id();
        let session_id = session.id();

        let previous = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let previous = sessions.remove(&user_id);
            if let Some(previous) = previous.as_ref() {
                previous.close(CloseReason::Superseded);
            }
            sessions.insert(user_id, session);
            previous
        };

        metrics::record_session_admitted(previous.is_some());
        info!(
            %session_id,
            user_id,
            replaced = previous.as_ref().map(|previous| previous.id().to_string()),
            "realtime session admitted"
        );
        previous
    }

    /// Remove `session` only if it is still the one registered for its user.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&session.user_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.user_id());
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).get(&user_id).cloned()
    }

    pub fn connected_users(&self) -> Vec<UserId> {
        let mut users = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect::<Vec<_>>();
        users.sort_unstable();
        users
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every outbound queue so each write loop flushes and sends a
    /// going-away close frame. Returns how many sessions were signalled.
    pub fn close_all(&self) -> usize {
        let sessions = self.sessions();
        for session in &sessions {
            session.close_queue();
        }
        info!(sessions = sessions.len(), "closing all realtime sessions");
        sessions.len()
    }
}
