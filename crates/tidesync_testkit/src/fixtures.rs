//! Test fixtures.
//!
//! Everything here expects to run inside a Tokio runtime
//! (`#[tokio::test]`).

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tidesync_auth::{MockAuthTransport, Permission, Token};
use tidesync_session::{
    AuthenticatedUser, BackoffConfig, Clock, ErrorHandler, ManualClock, ManualTimer, MemoryReplica,
    NetworkGate, Session, SessionConfig, SessionError, SessionRegistry, SessionServices,
    SessionState, SyncEnvironment,
};
use tokio::runtime::Handle;
use tracing::debug;

/// Endpoint used by every fixture.
pub const AUTH_ENDPOINT: &str = "https://auth.example.com/auth";

/// Identity of the fixture user.
pub const USER_IDENTITY: &str = "alice";

/// Installs a tracing subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Creates a refresh token for the fixture user.
pub fn refresh_token(value: &str, expires_ms: i64) -> Token {
    Token::new(value, USER_IDENTITY, None, expires_ms, [Permission::Refresh])
}

/// Creates an access token for the fixture user scoped to `path`.
pub fn access_token(path: &str, expires_ms: i64) -> Token {
    Token::new(
        format!("access{}", path.replace('/', "-")),
        USER_IDENTITY,
        Some(path.to_string()),
        expires_ms,
        [Permission::Download, Permission::Upload],
    )
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached within 5s");
}

/// Awaits `future`, failing the test if it takes longer than five seconds.
pub async fn within_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Lets spawned tasks run for a moment.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// A virtual-time environment.
pub struct TestEnv {
    /// The clock.
    pub clock: Arc<ManualClock>,
    /// The timer over `clock`.
    pub timer: Arc<ManualTimer>,
    /// Environment wired to the clock and timer.
    pub env: SyncEnvironment,
}

impl TestEnv {
    /// Creates an environment at time zero on the current runtime.
    pub fn new() -> Self {
        Self::with_backoff(BackoffConfig::default())
    }

    /// Creates an environment with a custom backoff.
    pub fn with_backoff(backoff: BackoffConfig) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let timer = Arc::new(ManualTimer::new(Arc::clone(&clock)));
        let env = SyncEnvironment::new(Handle::current())
            .with_clock(clock.clone())
            .with_timer(timer.clone())
            .with_backoff(backoff);
        Self { clock, timer, env }
    }

    /// Moves virtual time forward.
    pub fn advance(&self, by: Duration) {
        debug!(by_ms = by.as_millis() as u64, "advancing virtual time");
        self.timer.advance(by);
    }

    /// Returns the virtual time in milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Records every error delivered to a session's error handler.
#[derive(Default)]
pub struct ErrorRecorder {
    seen: std::sync::Mutex<Vec<(SessionState, SessionError)>>,
}

impl ErrorRecorder {
    /// Creates a recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a handler that records into this recorder.
    pub fn handler(self: &Arc<Self>) -> ErrorHandler {
        let recorder = Arc::clone(self);
        Arc::new(move |session: &Session, error: &SessionError| {
            recorder
                .seen
                .lock()
                .expect("recorder poisoned")
                .push((session.state(), error.clone()));
        })
    }

    /// Returns the recorded errors.
    pub fn errors(&self) -> Vec<SessionError> {
        self.entries().into_iter().map(|(_, error)| error).collect()
    }

    /// Returns the recorded errors with the session state at delivery.
    pub fn entries(&self) -> Vec<(SessionState, SessionError)> {
        self.seen.lock().expect("recorder poisoned").clone()
    }

    /// Returns how many errors were recorded.
    pub fn count(&self) -> usize {
        self.seen.lock().expect("recorder poisoned").len()
    }
}

/// Everything a session needs, scripted.
pub struct SessionHarness {
    /// Virtual time.
    pub time: TestEnv,
    /// Scripted transport.
    pub transport: Arc<MockAuthTransport>,
    /// In-memory replica.
    pub replica: Arc<MemoryReplica>,
    /// Connectivity gate.
    pub gate: Arc<NetworkGate>,
    /// A logged-in user with a refresh token valid for one hour.
    pub user: Arc<AuthenticatedUser>,
}

impl SessionHarness {
    /// Creates a harness with the device online.
    pub fn online() -> Self {
        Self::new(true)
    }

    /// Creates a harness with the device offline.
    pub fn offline() -> Self {
        Self::new(false)
    }

    /// Creates a harness.
    pub fn new(online: bool) -> Self {
        let time = TestEnv::new();
        let transport = Arc::new(MockAuthTransport::new());
        let user = AuthenticatedUser::restore(
            refresh_token("refresh-1", 3_600_000),
            Some(AUTH_ENDPOINT.to_string()),
            transport.clone(),
            time.env.clone(),
        );
        Self {
            time,
            transport,
            replica: Arc::new(MemoryReplica::new()),
            gate: Arc::new(NetworkGate::new(online)),
            user,
        }
    }

    /// Returns the collaborators for [`Session::start`].
    pub fn services(&self) -> SessionServices {
        SessionServices {
            transport: self.transport.clone(),
            replica: self.replica.clone(),
            gate: Arc::clone(&self.gate),
            env: self.time.env.clone(),
        }
    }

    /// Starts a session.
    pub fn start(&self, local_path: &str, resource_url: &str) -> Session {
        self.start_with(SessionConfig::new(local_path, resource_url))
    }

    /// Starts a session from a full configuration.
    pub fn start_with(&self, config: SessionConfig) -> Session {
        Session::start(config, Arc::clone(&self.user), self.services()).expect("session start")
    }

    /// Creates a registry sharing this harness's gate, replica and time.
    pub fn registry(&self) -> SessionRegistry {
        SessionRegistry::new(
            Arc::clone(&self.gate),
            self.replica.clone(),
            self.time.env.clone(),
        )
    }
}
