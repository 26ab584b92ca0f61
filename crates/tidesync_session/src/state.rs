//! Session state machine.
//!
//! The machine is pure: [`StateMachine::handle`] takes an [`Event`] and a
//! snapshot of the outside world ([`Context`]) and returns the [`Effect`]s the
//! driver has to carry out. Leaving a state releases whatever that state
//! acquired (in-flight request, connectivity subscription, attached replica)
//! before the next state's entry effects are emitted.
//!
//! Every state change bumps a generation counter. Asynchronous completions
//! carry the generation they were started under and are dropped if it is no
//! longer current.

use crate::error::SessionError;
use std::fmt;
use tidesync_auth::{ErrorCategory, Token};
use tracing::{debug, warn};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Obtaining an access token for the remote resource.
    Authenticating,
    /// Attaching the local replica.
    Binding,
    /// Synchronizing.
    Bound,
    /// Idle. A bind starts over.
    Unbound,
    /// Terminal.
    Stopped,
}

impl SessionState {
    /// Returns true for the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }

    /// Returns true while the session is working towards or keeping a bind.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Authenticating | SessionState::Binding | SessionState::Bound
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Authenticating => "AUTHENTICATING",
            SessionState::Binding => "BINDING",
            SessionState::Bound => "BOUND",
            SessionState::Unbound => "UNBOUND",
            SessionState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Caller asked to bind.
    Bind,
    /// Caller asked to unbind.
    Unbind,
    /// Caller asked to stop.
    Stop,
    /// The sync protocol reported an error.
    ProtocolError {
        /// Code as reported.
        raw_code: i32,
        /// Message from the server.
        message: String,
    },
    /// Connectivity changed.
    ConnectivityChanged {
        /// New connectivity.
        online: bool,
    },
    /// An access-token request succeeded.
    AccessTokenIssued {
        /// Generation the request was started under.
        generation: u64,
        /// The token.
        token: Token,
    },
    /// An access-token request failed.
    AuthenticationFailed {
        /// Generation the request was started under.
        generation: u64,
        /// Why it failed.
        error: SessionError,
    },
    /// The replica was attached.
    ReplicaAttached {
        /// Generation the attach was started under.
        generation: u64,
    },
    /// The replica could not be attached.
    ReplicaAttachFailed {
        /// Generation the attach was started under.
        generation: u64,
        /// Why it failed.
        error: SessionError,
    },
}

impl Event {
    fn generation(&self) -> Option<u64> {
        match self {
            Event::AccessTokenIssued { generation, .. }
            | Event::AuthenticationFailed { generation, .. }
            | Event::ReplicaAttached { generation }
            | Event::ReplicaAttachFailed { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

/// Work the driver carries out on behalf of the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Abort the in-flight access-token request.
    CancelNetworkTask,
    /// Start listening for connectivity changes.
    SubscribeNetwork,
    /// Stop listening for connectivity changes.
    UnsubscribeNetwork,
    /// Request an access token. Report the outcome tagged with `generation`.
    RequestAccessToken {
        /// Generation to tag the outcome with.
        generation: u64,
    },
    /// Cache an access token for the session's resource.
    StoreAccessToken(Token),
    /// Drop the cached access token for the session's resource.
    InvalidateAccessToken,
    /// Attach the replica. Report the outcome tagged with `generation`.
    AttachReplica {
        /// Generation to tag the outcome with.
        generation: u64,
    },
    /// Detach the replica.
    DetachReplica,
    /// Log the owning user out.
    InvalidateUser,
    /// Deliver an error to the session's error handler.
    Report(SessionError),
}

/// Snapshot of the world the machine's decisions depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    /// The device is online.
    pub online: bool,
    /// A valid access token for the resource is cached.
    pub has_valid_access_token: bool,
    /// The owning user is still logged in.
    pub user_logged_in: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            online: true,
            has_valid_access_token: false,
            user_logged_in: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenSource {
    /// A token was stored by the same step.
    Ready,
    /// Use the cache if it holds a valid token.
    Cache,
    /// Ignore the cache.
    Fetch,
}

/// The session state machine.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SessionState,
    generation: u64,
    request_in_flight: bool,
    subscribed: bool,
    attached: bool,
}

impl StateMachine {
    /// Creates a machine in `Authenticating`. Call [`start`](Self::start)
    /// to get its entry effects.
    pub fn new() -> Self {
        Self {
            state: SessionState::Authenticating,
            generation: 0,
            request_in_flight: false,
            subscribed: false,
            attached: false,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Runs the entry effects of the initial state.
    pub fn start(&mut self, ctx: &Context) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.enter(ctx, TokenSource::Cache, &mut effects);
        effects
    }

    /// Applies one event.
    pub fn handle(&mut self, event: Event, ctx: &Context) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(generation) = event.generation() {
            if generation != self.generation {
                debug!(
                    state = %self.state,
                    generation,
                    current = self.generation,
                    "dropping stale completion"
                );
                return effects;
            }
        }

        match (self.state, event) {
            (SessionState::Stopped, _) => {}

            (_, Event::Stop) => self.goto(SessionState::Stopped, ctx, &mut effects),

            (SessionState::Unbound, Event::Unbind) => {}
            (_, Event::Unbind) => self.goto(SessionState::Unbound, ctx, &mut effects),

            (SessionState::Authenticating | SessionState::Unbound, Event::Bind) => {
                self.goto(SessionState::Authenticating, ctx, &mut effects)
            }
            (_, Event::Bind) => {}

            (SessionState::Authenticating, Event::ConnectivityChanged { online: true }) => {
                if self.subscribed {
                    self.subscribed = false;
                    effects.push(Effect::UnsubscribeNetwork);
                    self.request_access_token(&mut effects);
                }
            }
            (_, Event::ConnectivityChanged { .. }) => {}

            (SessionState::Authenticating, Event::AccessTokenIssued { token, .. }) => {
                self.request_in_flight = false;
                effects.push(Effect::StoreAccessToken(token));
                self.goto_with(SessionState::Binding, ctx, TokenSource::Ready, &mut effects);
            }
            (SessionState::Binding, Event::AccessTokenIssued { token, .. }) => {
                self.request_in_flight = false;
                effects.push(Effect::StoreAccessToken(token));
                effects.push(Effect::AttachReplica {
                    generation: self.generation,
                });
            }

            (
                SessionState::Authenticating | SessionState::Binding,
                Event::AuthenticationFailed { error, .. },
            ) => {
                self.request_in_flight = false;
                warn!(state = %self.state, error = %error, "authentication failed");
                self.goto(SessionState::Unbound, ctx, &mut effects);
                if error.is_user_fatal() {
                    effects.push(Effect::InvalidateUser);
                }
                effects.push(Effect::Report(error));
            }

            (SessionState::Binding, Event::ReplicaAttached { .. }) => {
                self.goto(SessionState::Bound, ctx, &mut effects);
                self.attached = true;
            }
            (SessionState::Binding, Event::ReplicaAttachFailed { error, .. }) => {
                warn!(error = %error, "replica attach failed");
                self.goto(SessionState::Unbound, ctx, &mut effects);
                effects.push(Effect::Report(error));
            }

            (state, Event::ProtocolError { raw_code, message }) => {
                self.protocol_error(state, raw_code, message, ctx, &mut effects)
            }

            (state, event) => {
                debug!(state = %state, event = ?event, "event ignored");
            }
        }

        effects
    }

    fn protocol_error(
        &mut self,
        state: SessionState,
        raw_code: i32,
        message: String,
        ctx: &Context,
        effects: &mut Vec<Effect>,
    ) {
        let error = SessionError::protocol(raw_code, message);
        let category = error.category();
        if let Some(code) = error.code() {
            if code.has_ambiguous_category() {
                warn!(%code, %category, "error code with ambiguous classification");
            }
        }

        match (state, category) {
            (SessionState::Bound, ErrorCategory::Transient) => {
                debug!(raw_code, "transient protocol error ignored");
            }
            (SessionState::Bound, ErrorCategory::Recoverable) => {
                debug!(raw_code, "access token expired, rebinding");
                effects.push(Effect::InvalidateAccessToken);
                self.goto_with(SessionState::Binding, ctx, TokenSource::Fetch, effects);
            }
            (_, category) if category.stops_session() => {
                warn!(state = %state, error = %error, "protocol error stops session");
                self.goto(SessionState::Stopped, ctx, effects);
                effects.push(Effect::Report(error));
            }
            _ => {
                debug!(state = %state, raw_code, "protocol error ignored outside bound state");
            }
        }
    }

    fn goto(&mut self, target: SessionState, ctx: &Context, effects: &mut Vec<Effect>) {
        self.goto_with(target, ctx, TokenSource::Cache, effects);
    }

    fn goto_with(
        &mut self,
        target: SessionState,
        ctx: &Context,
        source: TokenSource,
        effects: &mut Vec<Effect>,
    ) {
        self.exit(effects);
        debug!(from = %self.state, to = %target, generation = self.generation + 1, "session transition");
        self.state = target;
        self.generation += 1;
        self.enter(ctx, source, effects);
    }

    fn exit(&mut self, effects: &mut Vec<Effect>) {
        if std::mem::take(&mut self.request_in_flight) {
            effects.push(Effect::CancelNetworkTask);
        }
        if std::mem::take(&mut self.subscribed) {
            effects.push(Effect::UnsubscribeNetwork);
        }
        if std::mem::take(&mut self.attached) {
            effects.push(Effect::DetachReplica);
        }
    }

    fn enter(&mut self, ctx: &Context, source: TokenSource, effects: &mut Vec<Effect>) {
        match self.state {
            SessionState::Authenticating => {
                if !ctx.user_logged_in {
                    self.goto(SessionState::Unbound, ctx, effects);
                    effects.push(Effect::Report(SessionError::UserLoggedOut));
                } else if ctx.has_valid_access_token {
                    self.goto_with(SessionState::Binding, ctx, TokenSource::Cache, effects);
                } else if ctx.online {
                    self.request_access_token(effects);
                } else {
                    debug!("offline, waiting for connectivity");
                    self.subscribed = true;
                    effects.push(Effect::SubscribeNetwork);
                }
            }
            SessionState::Binding => {
                let usable = match source {
                    TokenSource::Ready => true,
                    TokenSource::Cache => ctx.has_valid_access_token,
                    TokenSource::Fetch => false,
                };
                if usable {
                    effects.push(Effect::AttachReplica {
                        generation: self.generation,
                    });
                } else {
                    self.request_access_token(effects);
                }
            }
            SessionState::Bound | SessionState::Unbound | SessionState::Stopped => {}
        }
    }

    fn request_access_token(&mut self, effects: &mut Vec<Effect>) {
        self.request_in_flight = true;
        effects.push(Effect::RequestAccessToken {
            generation: self.generation,
        });
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_auth::{AuthError, ErrorCode};

    const ONLINE: Context = Context {
        online: true,
        has_valid_access_token: false,
        user_logged_in: true,
    };

    const OFFLINE: Context = Context {
        online: false,
        has_valid_access_token: false,
        user_logged_in: true,
    };

    fn access_token() -> Token {
        Token::new("a", "alice", Some("/alice/notes".into()), 60_000, [])
    }

    /// Drives a fresh machine to `Bound` and returns it.
    fn bound() -> StateMachine {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);
        let g = machine.generation();
        machine.handle(
            Event::AccessTokenIssued {
                generation: g,
                token: access_token(),
            },
            &ONLINE,
        );
        let g = machine.generation();
        machine.handle(Event::ReplicaAttached { generation: g }, &ONLINE);
        assert_eq!(machine.state(), SessionState::Bound);
        machine
    }

    #[test]
    fn online_start_requests_token() {
        let mut machine = StateMachine::new();
        let effects = machine.start(&ONLINE);
        assert_eq!(machine.state(), SessionState::Authenticating);
        assert_eq!(effects, vec![Effect::RequestAccessToken { generation: 0 }]);
    }

    #[test]
    fn offline_start_waits_for_network() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.start(&OFFLINE), vec![Effect::SubscribeNetwork]);

        let effects = machine.handle(Event::ConnectivityChanged { online: false }, &OFFLINE);
        assert!(effects.is_empty());

        let effects = machine.handle(Event::ConnectivityChanged { online: true }, &ONLINE);
        assert_eq!(
            effects,
            vec![
                Effect::UnsubscribeNetwork,
                Effect::RequestAccessToken { generation: 0 }
            ]
        );

        // Already requesting; a second online event changes nothing.
        assert!(machine
            .handle(Event::ConnectivityChanged { online: true }, &ONLINE)
            .is_empty());
    }

    #[test]
    fn cached_token_skips_authentication() {
        let ctx = Context {
            has_valid_access_token: true,
            ..ONLINE
        };
        let mut machine = StateMachine::new();
        let effects = machine.start(&ctx);
        assert_eq!(machine.state(), SessionState::Binding);
        assert_eq!(effects, vec![Effect::AttachReplica { generation: 1 }]);
    }

    #[test]
    fn logged_out_user_cannot_authenticate() {
        let ctx = Context {
            user_logged_in: false,
            ..ONLINE
        };
        let mut machine = StateMachine::new();
        let effects = machine.start(&ctx);
        assert_eq!(machine.state(), SessionState::Unbound);
        assert_eq!(effects, vec![Effect::Report(SessionError::UserLoggedOut)]);
    }

    #[test]
    fn happy_path_reaches_bound() {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);

        let effects = machine.handle(
            Event::AccessTokenIssued {
                generation: 0,
                token: access_token(),
            },
            &ONLINE,
        );
        assert_eq!(machine.state(), SessionState::Binding);
        assert_eq!(
            effects,
            vec![
                Effect::StoreAccessToken(access_token()),
                Effect::AttachReplica { generation: 1 }
            ]
        );

        let effects = machine.handle(Event::ReplicaAttached { generation: 1 }, &ONLINE);
        assert_eq!(machine.state(), SessionState::Bound);
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_completions_are_dropped() {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);
        machine.handle(Event::Bind, &ONLINE);
        assert_eq!(machine.generation(), 1);

        let effects = machine.handle(
            Event::AccessTokenIssued {
                generation: 0,
                token: access_token(),
            },
            &ONLINE,
        );
        assert!(effects.is_empty());
        assert_eq!(machine.state(), SessionState::Authenticating);
    }

    #[test]
    fn bind_while_authenticating_restarts() {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);
        let effects = machine.handle(Event::Bind, &ONLINE);
        assert_eq!(
            effects,
            vec![
                Effect::CancelNetworkTask,
                Effect::RequestAccessToken { generation: 1 }
            ]
        );
    }

    #[test]
    fn auth_failure_unbinds_and_reports() {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);
        let error = SessionError::Auth(AuthError::Transport("timeout".into()));

        let effects = machine.handle(
            Event::AuthenticationFailed {
                generation: 0,
                error: error.clone(),
            },
            &ONLINE,
        );
        assert_eq!(machine.state(), SessionState::Unbound);
        assert_eq!(effects, vec![Effect::Report(error)]);

        let effects = machine.handle(Event::Bind, &ONLINE);
        assert_eq!(machine.state(), SessionState::Authenticating);
        assert_eq!(effects, vec![Effect::RequestAccessToken { generation: 2 }]);
    }

    #[test]
    fn user_fatal_auth_failure_invalidates_user() {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);
        let error = SessionError::Auth(AuthError::server(ErrorCode::AccessDenied, "no"));

        let effects = machine.handle(
            Event::AuthenticationFailed {
                generation: 0,
                error: error.clone(),
            },
            &ONLINE,
        );
        assert_eq!(
            effects,
            vec![Effect::InvalidateUser, Effect::Report(error)]
        );
    }

    #[test]
    fn attach_failure_unbinds() {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);
        machine.handle(
            Event::AccessTokenIssued {
                generation: 0,
                token: access_token(),
            },
            &ONLINE,
        );
        let error = SessionError::Replica("locked".into());
        let effects = machine.handle(
            Event::ReplicaAttachFailed {
                generation: 1,
                error: error.clone(),
            },
            &ONLINE,
        );
        assert_eq!(machine.state(), SessionState::Unbound);
        assert_eq!(effects, vec![Effect::Report(error)]);
    }

    #[test]
    fn bound_ignores_transient_errors() {
        let mut machine = bound();
        for raw in [100, 102, 109, 113, 200, 201] {
            let effects = machine.handle(
                Event::ProtocolError {
                    raw_code: raw,
                    message: "x".into(),
                },
                &ONLINE,
            );
            assert!(effects.is_empty(), "code {raw}");
            assert_eq!(machine.state(), SessionState::Bound);
        }
    }

    #[test]
    fn expired_access_token_rebinds() {
        let mut machine = bound();
        let g = machine.generation();
        let effects = machine.handle(
            Event::ProtocolError {
                raw_code: ErrorCode::TokenExpired.as_i32(),
                message: "expired".into(),
            },
            &Context {
                has_valid_access_token: true,
                ..ONLINE
            },
        );
        assert_eq!(machine.state(), SessionState::Binding);
        assert_eq!(
            effects,
            vec![
                Effect::InvalidateAccessToken,
                Effect::DetachReplica,
                Effect::RequestAccessToken { generation: g + 1 }
            ]
        );

        machine.handle(
            Event::AccessTokenIssued {
                generation: g + 1,
                token: access_token(),
            },
            &ONLINE,
        );
        machine.handle(Event::ReplicaAttached { generation: g + 1 }, &ONLINE);
        assert_eq!(machine.state(), SessionState::Bound);
    }

    #[test]
    fn fatal_errors_stop_and_report_once() {
        for raw in [105, 203, 206, 209, 210, 211, 212, 225] {
            let mut machine = bound();
            let effects = machine.handle(
                Event::ProtocolError {
                    raw_code: raw,
                    message: "fatal".into(),
                },
                &ONLINE,
            );
            assert_eq!(machine.state(), SessionState::Stopped, "code {raw}");
            let reports = effects
                .iter()
                .filter(|e| matches!(e, Effect::Report(_)))
                .count();
            assert_eq!(reports, 1);
            assert!(effects.contains(&Effect::DetachReplica));
        }
    }

    #[test]
    fn auth_protocol_error_while_bound_is_fatal() {
        let mut machine = bound();
        machine.handle(
            Event::ProtocolError {
                raw_code: ErrorCode::InvalidParameters.as_i32(),
                message: "bad".into(),
            },
            &ONLINE,
        );
        assert_eq!(machine.state(), SessionState::Stopped);
    }

    #[test]
    fn unknown_code_stops_with_unrecognized_report() {
        let mut machine = bound();
        let effects = machine.handle(
            Event::ProtocolError {
                raw_code: 999,
                message: "?".into(),
            },
            &ONLINE,
        );
        assert_eq!(machine.state(), SessionState::Stopped);
        assert_eq!(
            effects.last(),
            Some(&Effect::Report(SessionError::Unrecognized {
                raw_code: 999,
                message: "?".into()
            }))
        );
    }

    #[test]
    fn unbind_releases_and_is_idempotent() {
        let mut machine = StateMachine::new();
        machine.start(&OFFLINE);

        let effects = machine.handle(Event::Unbind, &OFFLINE);
        assert_eq!(machine.state(), SessionState::Unbound);
        assert_eq!(effects, vec![Effect::UnsubscribeNetwork]);

        let generation = machine.generation();
        assert!(machine.handle(Event::Unbind, &OFFLINE).is_empty());
        assert_eq!(machine.generation(), generation);
    }

    #[test]
    fn bound_holds_replica_until_exit() {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);
        machine.handle(
            Event::AccessTokenIssued {
                generation: 0,
                token: access_token(),
            },
            &ONLINE,
        );
        let entering = machine.handle(Event::ReplicaAttached { generation: 1 }, &ONLINE);
        assert!(!entering.contains(&Effect::DetachReplica));

        assert_eq!(
            machine.handle(Event::Stop, &ONLINE),
            vec![Effect::DetachReplica]
        );
        assert!(machine.handle(Event::Stop, &ONLINE).is_empty());
    }

    #[test]
    fn unbind_from_bound_detaches() {
        let mut machine = bound();
        assert_eq!(
            machine.handle(Event::Unbind, &ONLINE),
            vec![Effect::DetachReplica]
        );
    }

    #[test]
    fn stop_is_terminal() {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);
        assert_eq!(
            machine.handle(Event::Stop, &ONLINE),
            vec![Effect::CancelNetworkTask]
        );
        assert_eq!(machine.state(), SessionState::Stopped);

        for event in [
            Event::Bind,
            Event::Unbind,
            Event::Stop,
            Event::ConnectivityChanged { online: true },
            Event::ProtocolError {
                raw_code: 206,
                message: "x".into(),
            },
        ] {
            assert!(machine.handle(event, &ONLINE).is_empty());
            assert_eq!(machine.state(), SessionState::Stopped);
        }
    }

    #[test]
    fn bind_is_ignored_while_binding_or_bound() {
        let mut machine = bound();
        assert!(machine.handle(Event::Bind, &ONLINE).is_empty());
        assert_eq!(machine.state(), SessionState::Bound);
    }

    #[test]
    fn fatal_error_outside_bound_stops() {
        let mut machine = StateMachine::new();
        machine.start(&ONLINE);
        machine.handle(
            Event::ProtocolError {
                raw_code: 100,
                message: "closed".into(),
            },
            &ONLINE,
        );
        assert_eq!(machine.state(), SessionState::Authenticating);

        machine.handle(
            Event::ProtocolError {
                raw_code: 211,
                message: "diverged".into(),
            },
            &ONLINE,
        );
        assert_eq!(machine.state(), SessionState::Stopped);
    }

    #[test]
    fn display_names() {
        assert_eq!(SessionState::Authenticating.to_string(), "AUTHENTICATING");
        assert_eq!(SessionState::Stopped.to_string(), "STOPPED");
        assert!(SessionState::Bound.is_active());
        assert!(!SessionState::Unbound.is_active());
        assert!(SessionState::Stopped.is_terminal());
    }
}
