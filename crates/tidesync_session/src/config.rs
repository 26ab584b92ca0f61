//! Configuration for sessions and the token refresher.

use crate::clock::{Clock, SystemClock, Timer, TokioTimer};
use crate::error::{SessionError, SessionResult};
use crate::session::ErrorHandler;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Configuration for one session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Path of the local replica. Unique per session.
    pub local_path: String,
    /// URI of the remote resource the replica synchronizes with.
    pub resource_url: String,
    /// Handler invoked with errors the caller has to see.
    pub error_handler: Option<ErrorHandler>,
}

impl SessionConfig {
    /// Creates a session configuration.
    pub fn new(local_path: impl Into<String>, resource_url: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            resource_url: resource_url.into(),
            error_handler: None,
        }
    }

    /// Sets the error handler.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Checks that the configuration can back a session.
    pub fn validate(&self) -> SessionResult<()> {
        if self.local_path.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "local path must be non-empty".into(),
            ));
        }
        if self.resource_url.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "resource URL must be non-empty".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("local_path", &self.local_path)
            .field("resource_url", &self.resource_url)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Exponential backoff between failed refresh attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier applied per further failure.
    pub multiplier: f64,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retrying after `failures` consecutive failures.
    ///
    /// Zero failures means no delay. The result never decreases as
    /// `failures` grows and never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5 * 60))
    }
}

/// Time, timers and the runtime that background work runs on.
#[derive(Clone)]
pub struct SyncEnvironment {
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Timer used for every wait.
    pub timer: Arc<dyn Timer>,
    /// Runtime that session drivers and refresh loops are spawned on.
    pub runtime: Handle,
    /// Backoff between failed refresh attempts.
    pub backoff: BackoffConfig,
}

impl SyncEnvironment {
    /// Creates an environment on the current Tokio runtime with the system
    /// clock and Tokio timers.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoRuntime`] outside a Tokio runtime.
    pub fn current() -> SessionResult<Self> {
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        Ok(Self::new(runtime))
    }

    /// Creates an environment on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            timer: Arc::new(TokioTimer),
            runtime,
            backoff: BackoffConfig::default(),
        }
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the timer.
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Replaces the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl fmt::Debug for SyncEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEnvironment")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_builder() {
        let handler: ErrorHandler = Arc::new(|_, _| {});
        let config = SessionConfig::new("/data/notes.db", "sync://host/alice/notes")
            .with_error_handler(handler);
        assert_eq!(config.local_path, "/data/notes.db");
        assert_eq!(config.resource_url, "sync://host/alice/notes");
        assert!(config.error_handler.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn blank_paths_are_rejected() {
        assert!(SessionConfig::new("", "sync://x").validate().is_err());
        assert!(SessionConfig::new("/a", " ").validate().is_err());
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(256));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(300));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let config = BackoffConfig::new(Duration::from_millis(150), Duration::from_secs(7))
            .with_multiplier(3.0);
        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(7));
            previous = delay;
        }
    }

    #[test]
    fn environment_requires_runtime() {
        assert!(matches!(
            SyncEnvironment::current(),
            Err(SessionError::NoRuntime)
        ));
    }
}
