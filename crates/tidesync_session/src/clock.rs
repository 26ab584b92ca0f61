//! Injectable time.
//!
//! The refresher and the session read the wall clock through [`Clock`] and
//! wait through [`Timer`], so tests can drive virtual time with
//! [`ManualClock`] and [`ManualTimer`] instead of sleeping for real.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

/// A boxed sleep future.
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Suspends the caller for a duration.
pub trait Timer: Send + Sync {
    /// Returns a future that completes after `duration`.
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// Timer backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Creates a clock reading `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Sets the clock.
    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

struct Sleeper {
    deadline_ms: i64,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct TimerState {
    sleepers: Vec<Sleeper>,
    requested: Vec<Duration>,
}

/// A timer over a [`ManualClock`].
///
/// Sleepers wake only when [`advance`](Self::advance) or
/// [`advance_to_next`](Self::advance_to_next) moves the clock past their
/// deadline. Every requested delay is recorded.
pub struct ManualTimer {
    clock: Arc<ManualClock>,
    state: Mutex<TimerState>,
}

impl ManualTimer {
    /// Creates a timer driving `clock`.
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(TimerState::default()),
        }
    }

    /// Returns the clock this timer drives.
    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Moves virtual time forward and wakes every sleeper that is due.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
        self.wake_due();
    }

    /// Moves virtual time to the earliest pending deadline.
    ///
    /// Returns the step taken, or `None` if nothing is sleeping.
    pub fn advance_to_next(&self) -> Option<Duration> {
        let next = {
            let mut state = self.state.lock();
            state.sleepers.retain(|s| !s.wake.is_closed());
            state.sleepers.iter().map(|s| s.deadline_ms).min()?
        };
        let step = Duration::from_millis(next.saturating_sub(self.clock.now_ms()).max(0) as u64);
        self.advance(step);
        Some(step)
    }

    /// Returns how many sleepers are waiting.
    pub fn pending(&self) -> usize {
        let mut state = self.state.lock();
        state.sleepers.retain(|s| !s.wake.is_closed());
        state.sleepers.len()
    }

    /// Returns every delay requested so far, in order.
    pub fn requested_delays(&self) -> Vec<Duration> {
        self.state.lock().requested.clone()
    }

    fn wake_due(&self) {
        let now = self.clock.now_ms();
        let due: Vec<Sleeper> = {
            let mut state = self.state.lock();
            let (due, waiting) = std::mem::take(&mut state.sleepers)
                .into_iter()
                .partition(|s| s.deadline_ms <= now);
            state.sleepers = waiting;
            due
        };
        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
    }
}

impl Timer for ManualTimer {
    fn sleep(&self, duration: Duration) -> Sleep {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.requested.push(duration);
            if duration.is_zero() {
                let _ = tx.send(());
            } else {
                let deadline_ms = self
                    .clock
                    .now_ms()
                    .saturating_add(duration.as_millis() as i64);
                state.sleepers.push(Sleeper {
                    deadline_ms,
                    wake: tx,
                });
            }
        }
        Box::pin(async move {
            let _ = rx.await;
        })
    }
}
