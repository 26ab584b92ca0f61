//! Registry of sessions keyed by local replica path.

use crate::config::{SessionConfig, SyncEnvironment};
use crate::error::SessionResult;
use crate::network::NetworkGate;
use crate::replica::LocalReplica;
use crate::session::{Session, SessionServices};
use crate::state::SessionState;
use crate::user::AuthenticatedUser;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tidesync_auth::AuthenticationTransport;
use tracing::{debug, info, warn};

/// Holds at most one session per local replica path.
///
/// Construct one per process and share it. Sessions are only ever removed by
/// [`remove`](Self::remove); the registry never drops one on its own.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    gate: Arc<NetworkGate>,
    replica: Arc<dyn LocalReplica>,
    env: SyncEnvironment,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(gate: Arc<NetworkGate>, replica: Arc<dyn LocalReplica>, env: SyncEnvironment) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            gate,
            replica,
            env,
        }
    }

    /// Returns the session for `config.local_path`, starting one if none
    /// exists.
    ///
    /// An existing session is returned as is, even if it was started with a
    /// different user or resource.
    ///
    /// # Errors
    ///
    /// Returns an error if a new session cannot be started.
    pub fn get_or_create(
        &self,
        config: SessionConfig,
        transport: Arc<dyn AuthenticationTransport>,
        user: Arc<AuthenticatedUser>,
    ) -> SessionResult<Session> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&config.local_path) {
            return Ok(existing.clone());
        }

        let path = config.local_path.clone();
        let services = SessionServices {
            transport,
            replica: Arc::clone(&self.replica),
            gate: Arc::clone(&self.gate),
            env: self.env.clone(),
        };
        let session = Session::start(config, user, services)?;
        sessions.insert(path, session.clone());
        debug!(path = session.path(), sessions = sessions.len(), "session registered");
        Ok(session)
    }

    /// Returns the session for a path, if any.
    pub fn get(&self, local_path: &str) -> Option<Session> {
        self.sessions.lock().get(local_path).cloned()
    }

    /// Removes a session.
    ///
    /// Returns false if the session was not registered.
    pub fn remove(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.lock();
        let key = sessions
            .iter()
            .find(|(_, existing)| existing.ptr_eq(session))
            .map(|(path, _)| path.clone());
        let Some(key) = key else {
            return false;
        };
        sessions.remove(&key);
        if !session.state().is_terminal() {
            warn!(path = %key, state = %session.state(), "removed a session that is not stopped");
        }
        debug!(path = %key, "session removed");
        true
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns true if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Stops every session owned by `user`, then logs the user out.
    ///
    /// Waits for each session to reach `Stopped` before the user's tokens
    /// are cleared. The sessions stay registered until
    /// [`remove`](Self::remove)d. Returns how many sessions were stopped.
    pub async fn logout(&self, user: &Arc<AuthenticatedUser>) -> usize {
        let owned: Vec<Session> = self
            .sessions
            .lock()
            .values()
            .filter(|session| Arc::ptr_eq(session.user(), user))
            .cloned()
            .collect();

        for session in &owned {
            session.stop();
        }
        for session in &owned {
            session.wait_for_state(SessionState::Stopped).await;
        }
        user.logout();
        info!(identity = user.identity(), sessions = owned.len(), "sessions stopped for logout");
        owned.len()
    }

    /// Returns every session owned by the user with `identity`.
    pub fn sessions_for_user(&self, identity: &str) -> Vec<Session> {
        self.sessions
            .lock()
            .values()
            .filter(|session| session.user().identity() == identity)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("gate", &self.gate)
            .finish()
    }
}
