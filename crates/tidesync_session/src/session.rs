//! Sessions and their driver task.
//!
//! A [`Session`] is a cheap handle. All state lives in a driver task that
//! owns the [`StateMachine`] and processes one event at a time from the
//! session's queue: caller requests, connectivity changes, and completions of
//! the work the machine asked for.

use crate::config::{SessionConfig, SyncEnvironment};
use crate::error::{SessionError, SessionResult};
use crate::network::{ListenerId, NetworkGate};
use crate::replica::{LocalReplica, ReplicaHandle};
use crate::state::{Context, Effect, Event, SessionState, StateMachine};
use crate::user::AuthenticatedUser;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tidesync_auth::{AuthError, AuthenticationTransport};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives errors a session cannot handle by itself.
pub type ErrorHandler = Arc<dyn Fn(&Session, &SessionError) + Send + Sync>;

struct Shared {
    local_path: String,
    resource_url: String,
    user: Arc<AuthenticatedUser>,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<SessionState>,
    error_handler: RwLock<Option<ErrorHandler>>,
}

/// Synchronization session for one local replica.
///
/// Cloning yields another handle to the same session. Handles compare equal
/// only if they refer to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// Collaborators a session works with.
#[derive(Clone)]
pub struct SessionServices {
    /// Transport for access-token requests.
    pub transport: Arc<dyn AuthenticationTransport>,
    /// Replica the session binds.
    pub replica: Arc<dyn LocalReplica>,
    /// Connectivity gate.
    pub gate: Arc<NetworkGate>,
    /// Clock, timer and runtime.
    pub env: SyncEnvironment,
}

impl Session {
    /// Starts a session in `Authenticating`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] if the configuration is
    /// unusable.
    pub fn start(
        config: SessionConfig,
        user: Arc<AuthenticatedUser>,
        services: SessionServices,
    ) -> SessionResult<Self> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Authenticating);
        let shared = Arc::new(Shared {
            local_path: config.local_path.clone(),
            resource_url: config.resource_url.clone(),
            user: Arc::clone(&user),
            events: events_tx,
            state: state_rx,
            error_handler: RwLock::new(config.error_handler.clone()),
        });

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            session: Arc::downgrade(&shared),
            local_path: config.local_path,
            resource_url: config.resource_url,
            machine: StateMachine::new(),
            state: state_tx,
            user,
            transport: services.transport,
            replica: services.replica,
            gate: services.gate,
            env: services.env.clone(),
            completions: completions_tx,
            network_task: None,
            subscription: None,
            replica_handle: None,
        };
        services.env.runtime.spawn(driver.run(events_rx, completions_rx));

        info!(path = %shared.local_path, url = %shared.resource_url, "session started");
        Ok(Self { shared })
    }

    /// Returns the local replica path.
    pub fn path(&self) -> &str {
        &self.shared.local_path
    }

    /// Returns the remote resource URL.
    pub fn resource_url(&self) -> &str {
        &self.shared.resource_url
    }

    /// Returns the user owning this session.
    pub fn user(&self) -> &Arc<AuthenticatedUser> {
        &self.shared.user
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Returns a receiver that observes every published state.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.clone()
    }

    /// Waits until the session reaches `target`.
    ///
    /// Returns the state the session ended up in if it stopped first.
    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        let mut rx = self.subscribe_state();
        loop {
            let current = *rx.borrow_and_update();
            if current == target || current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Asks the session to bind. Only acted on in `Unbound` or
    /// `Authenticating`, where it restarts authentication.
    pub fn bind(&self) {
        self.send(Event::Bind);
    }

    /// Asks the session to unbind.
    pub fn unbind(&self) {
        self.send(Event::Unbind);
    }

    /// Stops the session for good.
    pub fn stop(&self) {
        self.send(Event::Stop);
    }

    /// Reports an error raised by the sync protocol.
    pub fn on_error(&self, raw_code: i32, message: impl Into<String>) {
        self.send(Event::ProtocolError {
            raw_code,
            message: message.into(),
        });
    }

    /// Replaces the error handler.
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        *self.shared.error_handler.write() = handler;
    }

    /// Returns true if both handles refer to the same session.
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn send(&self, event: Event) {
        if self.shared.events.send(event).is_err() {
            debug!(path = %self.shared.local_path, "session driver has exited");
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.shared.local_path)
            .field("resource_url", &self.shared.resource_url)
            .field("state", &self.state())
            .finish()
    }
}

struct Driver {
    session: Weak<Shared>,
    local_path: String,
    resource_url: String,
    machine: StateMachine,
    state: watch::Sender<SessionState>,
    user: Arc<AuthenticatedUser>,
    transport: Arc<dyn AuthenticationTransport>,
    replica: Arc<dyn LocalReplica>,
    gate: Arc<NetworkGate>,
    env: SyncEnvironment,
    completions: mpsc::UnboundedSender<Event>,
    network_task: Option<JoinHandle<()>>,
    subscription: Option<ListenerId>,
    replica_handle: Option<ReplicaHandle>,
}

impl Driver {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut completions: mpsc::UnboundedReceiver<Event>,
    ) {
        let ctx = self.context();
        let effects = self.machine.start(&ctx);
        let mut queue = VecDeque::new();
        self.apply_all(effects, &mut queue);
        self.drain(queue);

        while !self.machine.state().is_terminal() {
            let event = tokio::select! {
                biased;
                Some(event) = completions.recv() => Some(event),
                event = events.recv() => event,
            };
            let Some(event) = event else {
                debug!(path = %self.local_path, "all session handles dropped");
                self.drain(VecDeque::from([Event::Stop]));
                break;
            };
            self.drain(VecDeque::from([event]));
        }

        self.release();
        debug!(path = %self.local_path, "session driver exited");
    }

    fn context(&self) -> Context {
        Context {
            online: self.gate.is_online(),
            has_valid_access_token: self.user.valid_access_token(&self.resource_url).is_some(),
            user_logged_in: self.user.is_logged_in(),
        }
    }

    /// Handles queued events, and the events they lead to, in order.
    fn drain(&mut self, mut queue: VecDeque<Event>) {
        while let Some(event) = queue.pop_front() {
            let ctx = self.context();
            let effects = self.machine.handle(event, &ctx);
            self.apply_all(effects, &mut queue);
        }
    }

    /// Applies effects, publishes the resulting state and delivers reports.
    fn apply_all(&mut self, effects: Vec<Effect>, queue: &mut VecDeque<Event>) {
        let mut reports = Vec::new();
        for effect in effects {
            self.apply(effect, queue, &mut reports);
        }

        let state = self.machine.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(path = %self.local_path, from = %current, to = %state, "state published");
            *current = state;
            true
        });

        for error in reports {
            self.report(&error);
        }
    }

    fn apply(&mut self, effect: Effect, queue: &mut VecDeque<Event>, reports: &mut Vec<SessionError>) {
        match effect {
            Effect::CancelNetworkTask => {
                if let Some(task) = self.network_task.take() {
                    task.abort();
                }
            }
            Effect::SubscribeNetwork => {
                if self.subscription.is_none() {
                    let session = Weak::clone(&self.session);
                    let listener = move |online: bool| {
                        if let Some(shared) = session.upgrade() {
                            let _ = shared.events.send(Event::ConnectivityChanged { online });
                        }
                    };
                    self.subscription = Some(self.gate.add_listener(Arc::new(listener)));
                }
                // The gate may have come online before the listener was in place.
                if self.gate.is_online() {
                    queue.push_back(Event::ConnectivityChanged { online: true });
                }
            }
            Effect::UnsubscribeNetwork => {
                if let Some(id) = self.subscription.take() {
                    self.gate.remove_listener(id);
                }
            }
            Effect::RequestAccessToken { generation } => {
                self.request_access_token(generation);
            }
            Effect::StoreAccessToken(token) => {
                self.user.add_access_token(self.resource_url.clone(), token);
            }
            Effect::InvalidateAccessToken => {
                self.user.invalidate_access_token(&self.resource_url);
            }
            Effect::AttachReplica { generation } => {
                let outcome = match self.user.access_token(&self.resource_url) {
                    Some(token) => self.replica.attach(&self.local_path, &token),
                    None => Err(SessionError::Replica("no access token available".into())),
                };
                match outcome {
                    Ok(handle) => {
                        if let Some(stale) = self.replica_handle.replace(handle) {
                            self.replica.detach(stale);
                        }
                        queue.push_back(Event::ReplicaAttached { generation });
                    }
                    Err(error) => queue.push_back(Event::ReplicaAttachFailed { generation, error }),
                }
            }
            Effect::DetachReplica => {
                if let Some(handle) = self.replica_handle.take() {
                    self.replica.detach(handle);
                }
            }
            Effect::InvalidateUser => {
                warn!(user = self.user.identity(), "user credentials rejected, logging out");
                self.user.logout();
            }
            Effect::Report(error) => reports.push(error),
        }
    }

    fn request_access_token(&mut self, generation: u64) {
        if let Some(previous) = self.network_task.take() {
            previous.abort();
        }
        let user = Arc::clone(&self.user);
        let transport = Arc::clone(&self.transport);
        let resource_url = self.resource_url.clone();
        let completions = self.completions.clone();

        debug!(path = %self.local_path, generation, "requesting access token");
        self.network_task = Some(self.env.runtime.spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                user.authenticate_resource_with(transport.as_ref(), &resource_url)
            })
            .await
            .unwrap_or_else(|e| {
                Err(SessionError::Auth(AuthError::Transport(format!(
                    "access token task failed: {e}"
                ))))
            });
            let event = match result {
                Ok(token) => Event::AccessTokenIssued { generation, token },
                Err(error) => Event::AuthenticationFailed { generation, error },
            };
            let _ = completions.send(event);
        }));
    }

    fn report(&self, error: &SessionError) {
        let Some(shared) = self.session.upgrade() else {
            return;
        };
        let handler = shared.error_handler.read().clone();
        let session = Session { shared };
        match handler {
            Some(handler) => handler(&session, error),
            None => error!(path = %self.local_path, error = %error, "unhandled session error"),
        }
    }

    fn release(&mut self) {
        if let Some(task) = self.network_task.take() {
            task.abort();
        }
        if let Some(id) = self.subscription.take() {
            self.gate.remove_listener(id);
        }
        if let Some(handle) = self.replica_handle.take() {
            self.replica.detach(handle);
        }
    }
}
