//! # tidesync session
//!
//! Session lifecycle for the tidesync client.
//!
//! This crate provides:
//! - [`TokenRefresher`] renewing a user's refresh token before it expires,
//!   with exponential backoff on failure
//! - [`AuthenticatedUser`] holding the refresh token and per-resource access
//!   tokens, persisted as a [`UserRecord`]
//! - [`NetworkGate`] broadcasting connectivity transitions
//! - The session state machine ([`StateMachine`]) and the [`Session`] driver
//!   that executes it
//! - [`SessionRegistry`] keeping at most one session per local replica path
//!
//! ## Architecture
//!
//! A session moves through
//! `AUTHENTICATING → BINDING → BOUND`, drops to `UNBOUND` when
//! authentication or binding fails, and ends in `STOPPED`. The transition
//! table is a pure function; a per-session driver task serializes every
//! event and carries out the resulting effects. Completions of asynchronous
//! work are tagged with the generation they were started under, and stale
//! ones are discarded.
//!
//! ## Key Invariants
//!
//! - One session per local path, process-wide
//! - Leaving a state releases what that state acquired
//! - Unknown server error codes stop the session
//! - Time is injected ([`Clock`], [`Timer`]), never read directly

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod error;
mod network;
mod refresher;
mod registry;
mod replica;
mod session;
mod state;
mod user;

pub use clock::{Clock, ManualClock, ManualTimer, Sleep, SystemClock, Timer, TokioTimer};
pub use config::{BackoffConfig, SessionConfig, SyncEnvironment};
pub use error::{SessionError, SessionResult};
pub use network::{ConnectivityListener, ListenerId, NetworkGate};
pub use refresher::{RefreshStatus, TokenRefresher};
pub use registry::SessionRegistry;
pub use replica::{LocalReplica, MemoryReplica, ReplicaHandle};
pub use session::{ErrorHandler, Session, SessionServices};
pub use state::{Context, Effect, Event, SessionState, StateMachine};
pub use user::{resource_path, AuthenticatedUser, UserRecord};
