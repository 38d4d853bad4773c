use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::connection::ConnectionHandle;

pub const SESSION_COOKIE: &str = "cpx_id";
pub const LANG_COOKIE: &str = "cpx_lang";

/// One cookie-keyed session: known id, optionally a pending login salt,
/// optionally a live connection worker.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub salt: Option<String>,
    pub connection: Option<ConnectionHandle>,
}

/// Authoritative map session id → `(salt, connection)`. The only shared
/// structure request handlers touch directly, so every mutation is a
/// single map operation.
#[derive(Clone)]
pub struct SessionTable {
    sessions: Arc<DashMap<String, Session>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Mint a fresh session for a request with no cookie, a malformed
    /// cookie, or a cookie whose entry is gone.
    pub fn issue_session(&self) -> String {
        let id = copperline_utils::session_id();
        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                salt: None,
                connection: None,
            },
        );
        id
    }

    /// Generate and store a login salt. Overwrites any prior salt: the
    /// handshake is one-shot per salt.
    pub fn bind_salt(&self, session_id: &str) -> Option<String> {
        let mut session = self.sessions.get_mut(session_id)?;
        let salt = copperline_utils::salt();
        session.salt = Some(salt.clone());
        Some(salt)
    }

    /// Bind a live worker into the session, compare-and-set on the salt
    /// so a concurrent `get_salt` invalidates the attempt. Consumes the
    /// salt and subscribes to worker liveness.
    pub fn bind_connection(
        &self,
        session_id: &str,
        salt: &str,
        handle: ConnectionHandle,
    ) -> bool {
        {
            let mut session = match self.sessions.get_mut(session_id) {
                Some(session) => session,
                None => return false,
            };
            if session.salt.as_deref() != Some(salt) {
                return false;
            }
            session.salt = None;
            session.connection = Some(handle.clone());
        }

        let sessions = self.sessions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            handle.closed().await;
            let removed = sessions.remove_if(&session_id, |_, session| {
                session
                    .connection
                    .as_ref()
                    .map(|c| c.id == handle.id)
                    .unwrap_or(false)
            });
            if removed.is_some() {
                info!(
                    session = %session_id,
                    agent = %handle.login,
                    "connection died, session reclaimed",
                );
            }
        });
        true
    }

    pub fn lookup(&self, cookies: &HashMap<String, String>) -> Option<Session> {
        let id = cookies.get(SESSION_COOKIE)?;
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Clear `(salt, connection)` but keep the id usable, e.g. after
    /// logout.
    pub fn revoke(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.salt = None;
            session.connection = None;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
