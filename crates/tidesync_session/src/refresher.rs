//! Background renewal of a refresh token.
//!
//! One [`TokenRefresher`] owns one refresh token. Installing a token cancels
//! whatever was scheduled and starts a fresh loop that sleeps until the token
//! expires, renews it, and backs off exponentially on failure.

use crate::config::SyncEnvironment;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_auth::{AuthError, AuthenticationTransport, Token};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the refresher is doing.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshStatus {
    /// Nothing scheduled: no endpoint, or the token never expires.
    Idle,
    /// Waiting for the token to expire.
    Scheduled,
    /// A refresh call is in flight.
    Refreshing,
    /// Waiting to retry after failures.
    BackingOff {
        /// Consecutive failures so far.
        failures: u32,
    },
    /// Renewal failed permanently. The user has to log in again.
    Stopped(AuthError),
    /// Cancelled by the owner.
    Cancelled,
}

/// Cooperative cancellation shared between a loop and its owner.
#[derive(Debug, Default)]
struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct RefreshTask {
    cancel: Arc<CancelFlag>,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

struct Inner {
    token: RwLock<Token>,
    endpoint: Option<String>,
    transport: Arc<dyn AuthenticationTransport>,
    env: SyncEnvironment,
    status: RwLock<RefreshStatus>,
    attempts: AtomicU64,
    shut_down: AtomicBool,
    // Held while the running loop is replaced and while a renewed token is
    // stored, so a cancelled loop can never overwrite a newer token.
    task: Mutex<Option<RefreshTask>>,
}

/// Keeps one refresh token fresh in the background.
pub struct TokenRefresher {
    inner: Arc<Inner>,
}

impl TokenRefresher {
    /// Creates a refresher for `token` and schedules its renewal.
    ///
    /// With no endpoint (or an empty one) nothing is ever scheduled.
    pub fn new(
        token: Token,
        endpoint: Option<String>,
        transport: Arc<dyn AuthenticationTransport>,
        env: SyncEnvironment,
    ) -> Self {
        let refresher = Self {
            inner: Arc::new(Inner {
                token: RwLock::new(token),
                endpoint: endpoint.filter(|e| !e.trim().is_empty()),
                transport,
                env,
                status: RwLock::new(RefreshStatus::Idle),
                attempts: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        };
        refresher.inner.reschedule(false);
        refresher
    }

    /// Returns the current refresh token.
    pub fn token(&self) -> Token {
        self.inner.token.read().clone()
    }

    /// Returns the authentication endpoint, if any.
    pub fn endpoint(&self) -> Option<&str> {
        self.inner.endpoint.as_deref()
    }

    /// Returns what the refresher is doing.
    pub fn status(&self) -> RefreshStatus {
        self.inner.status.read().clone()
    }

    /// Returns how many refresh calls have been made.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Replaces the refresh token and reschedules renewal.
    ///
    /// Has no scheduling effect after [`cancel`](Self::cancel).
    pub fn install(&self, token: Token) {
        let mut task = self.inner.task.lock();
        if let Some(previous) = task.take() {
            previous.stop();
        }
        *self.inner.token.write() = token;
        *task = self.inner.spawn(false);
    }

    /// Renews the token now instead of waiting for it to expire.
    pub fn refresh_now(&self) {
        self.inner.reschedule(true);
    }

    /// Stops renewal permanently.
    pub fn cancel(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.task.lock().take() {
            task.stop();
        }
        self.inner.set_status(RefreshStatus::Cancelled);
        debug!(identity = self.inner.token.read().identity(), "refresh cancelled");
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for TokenRefresher {
    fn drop(&mut self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.stop();
        }
    }
}

impl std::fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("token", &*self.inner.token.read())
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

impl Inner {
    fn set_status(&self, status: RefreshStatus) {
        *self.status.write() = status;
    }

    fn reschedule(self: &Arc<Self>, immediate: bool) {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.stop();
        }
        *task = self.spawn(immediate);
    }

    /// Starts a loop. Must be called with the task slot locked.
    fn spawn(self: &Arc<Self>, immediate: bool) -> Option<RefreshTask> {
        if self.shut_down.load(Ordering::SeqCst) {
            return None;
        }
        let Some(endpoint) = self.endpoint.clone() else {
            self.set_status(RefreshStatus::Idle);
            return None;
        };
        let cancel = Arc::new(CancelFlag::default());
        let handle = self.env.runtime.spawn(run(
            Arc::clone(self),
            Arc::clone(&cancel),
            endpoint,
            immediate,
        ));
        Some(RefreshTask { cancel, handle })
    }

    /// Sleeps unless cancelled first. Returns false if cancelled.
    async fn sleep(&self, delay: Duration, cancel: &CancelFlag) -> bool {
        let sleep = self.env.timer.sleep(delay);
        tokio::select! {
            _ = sleep => !cancel.is_cancelled(),
            _ = cancel.cancelled() => false,
        }
    }
}

async fn run(inner: Arc<Inner>, cancel: Arc<CancelFlag>, endpoint: String, mut immediate: bool) {
    loop {
        let token = inner.token.read().clone();

        if !immediate {
            let Some(delay) = token.time_until_expiry(inner.env.clock.now_ms()) else {
                debug!(identity = token.identity(), "refresh token never expires");
                inner.set_status(RefreshStatus::Idle);
                return;
            };
            inner.set_status(RefreshStatus::Scheduled);
            debug!(identity = token.identity(), delay_ms = delay.as_millis() as u64, "refresh scheduled");
            if !inner.sleep(delay, &cancel).await {
                return;
            }
        }
        immediate = false;

        let mut failures = 0u32;
        let renewed = loop {
            inner.set_status(RefreshStatus::Refreshing);
            let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;

            let transport = Arc::clone(&inner.transport);
            let value = token.value().to_string();
            let target = endpoint.clone();
            let result = tokio::task::spawn_blocking(move || transport.refresh(&value, &target))
                .await
                .unwrap_or_else(|e| Err(AuthError::Transport(format!("refresh task failed: {e}"))));

            if cancel.is_cancelled() {
                return;
            }

            match result {
                Ok(response) => break response.refresh_token,
                Err(err) if !err.is_retryable() => {
                    error!(identity = token.identity(), attempt, error = %err, "refresh failed permanently");
                    inner.set_status(RefreshStatus::Stopped(err));
                    return;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = inner.env.backoff.delay_for_attempt(failures);
                    warn!(
                        identity = token.identity(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "refresh failed, backing off"
                    );
                    inner.set_status(RefreshStatus::BackingOff { failures });
                    if !inner.sleep(delay, &cancel).await {
                        return;
                    }
                }
            }
        };

        {
            let _task = inner.task.lock();
            if cancel.is_cancelled() {
                return;
            }
            *inner.token.write() = renewed;
        }
        info!(identity = token.identity(), "refresh token renewed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, ManualTimer};
    use crate::config::BackoffConfig;
    use tidesync_auth::{ErrorCode, MockAuthTransport};
    use tokio::runtime::Handle;

    const ENDPOINT: &str = "https://auth.example.com/auth";

    struct Harness {
        clock: Arc<ManualClock>,
        timer: Arc<ManualTimer>,
        transport: Arc<MockAuthTransport>,
        env: SyncEnvironment,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let timer = Arc::new(ManualTimer::new(Arc::clone(&clock)));
        let env = SyncEnvironment::new(Handle::current())
            .with_clock(clock.clone())
            .with_timer(timer.clone())
            .with_backoff(BackoffConfig::default());
        Harness {
            clock,
            timer,
            transport: Arc::new(MockAuthTransport::new()),
            env,
        }
    }

    fn refresher(h: &Harness, token: Token) -> TokenRefresher {
        TokenRefresher::new(
            token,
            Some(ENDPOINT.to_string()),
            h.transport.clone(),
            h.env.clone(),
        )
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn token(value: &str, expires_ms: i64) -> Token {
        Token::new(value, "alice", None, expires_ms, [])
    }

    #[tokio::test]
    async fn refreshes_once_at_expiry() {
        let h = harness();
        h.transport.push_refresh_token(token("r2", 1_000_000));
        let refresher = refresher(&h, token("r1", 10_000));

        eventually(|| h.timer.pending() == 1).await;
        assert_eq!(h.timer.requested_delays(), vec![Duration::from_secs(10)]);

        h.timer.advance(Duration::from_millis(9_999));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.refresh_calls(), 0);

        h.timer.advance(Duration::from_millis(1));
        eventually(|| refresher.token().value() == "r2").await;
        assert_eq!(h.transport.refresh_calls(), 1);

        eventually(|| h.timer.requested_delays().len() == 2).await;
        assert_eq!(h.timer.requested_delays()[1], Duration::from_secs(990));
        assert_eq!(refresher.status(), RefreshStatus::Scheduled);
        assert_eq!(h.clock.now_ms(), 10_000);
    }

    #[tokio::test]
    async fn backs_off_until_success() {
        let h = harness();
        for _ in 0..3 {
            h.transport.push_refresh_error(AuthError::Transport("offline".into()));
        }
        h.transport.push_refresh_token(token("r2", i64::MAX));
        let refresher = refresher(&h, token("r1", 0));

        while refresher.token().value() != "r2" {
            eventually(|| h.timer.pending() == 1 || refresher.token().value() == "r2").await;
            h.timer.advance_to_next();
        }

        assert_eq!(h.transport.refresh_calls(), 4);
        assert_eq!(refresher.attempts(), 4);
        let delays = h.timer.requested_delays();
        assert_eq!(
            &delays[..4],
            &[
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test]
    async fn user_fatal_error_stops_refreshing() {
        let h = harness();
        h.transport
            .push_refresh_error(AuthError::server(ErrorCode::ExpiredRefreshToken, "expired"));
        let refresher = refresher(&h, token("r1", 0));

        eventually(|| matches!(refresher.status(), RefreshStatus::Stopped(_))).await;
        assert_eq!(h.transport.refresh_calls(), 1);
        assert_eq!(h.timer.pending(), 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_wait() {
        let h = harness();
        let refresher = refresher(&h, token("r1", 60_000));
        eventually(|| h.timer.pending() == 1).await;

        refresher.cancel();
        eventually(|| h.timer.pending() == 0).await;
        h.timer.advance(Duration::from_secs(120));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.transport.refresh_calls(), 0);
        assert_eq!(refresher.status(), RefreshStatus::Cancelled);

        refresher.install(token("r9", 10));
        assert_eq!(refresher.token().value(), "r9");
        assert_eq!(h.timer.pending(), 0);
    }

    #[tokio::test]
    async fn install_replaces_schedule() {
        let h = harness();
        let refresher = refresher(&h, token("r1", 60_000));
        eventually(|| h.timer.pending() == 1).await;

        refresher.install(token("r2", 5_000));
        eventually(|| h.timer.requested_delays().len() == 2).await;
        eventually(|| h.timer.pending() == 1).await;
        assert_eq!(h.timer.requested_delays()[1], Duration::from_secs(5));
    }

    #[tokio::test]
    async fn no_endpoint_means_idle() {
        let h = harness();
        let refresher = TokenRefresher::new(token("r1", 10), None, h.transport.clone(), h.env.clone());
        assert_eq!(refresher.status(), RefreshStatus::Idle);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.timer.pending(), 0);
        assert_eq!(h.transport.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn non_expiring_token_is_never_refreshed() {
        let h = harness();
        let refresher = refresher(&h, Token::non_expiring("debug", "alice"));
        eventually(|| refresher.status() == RefreshStatus::Idle).await;
        assert!(h.timer.requested_delays().is_empty());
    }

    #[tokio::test]
    async fn refresh_now_skips_the_wait() {
        let h = harness();
        h.transport.push_refresh_token(token("r2", 1_000_000));
        let refresher = refresher(&h, token("r1", 600_000));
        eventually(|| h.timer.pending() == 1).await;

        refresher.refresh_now();
        eventually(|| refresher.token().value() == "r2").await;
        assert_eq!(h.transport.refresh_calls(), 1);
        assert_eq!(h.clock.now_ms(), 0);
    }
}
