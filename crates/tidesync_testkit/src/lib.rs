//! # tidesync testkit
//!
//! Test utilities for tidesync.
//!
//! This crate provides:
//! - Fixtures: a virtual-time environment, a scripted session harness and
//!   an error-handler recorder
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn binds() {
//!     let harness = SessionHarness::online();
//!     harness.transport.push_access_token(access_token("/alice/notes", 60_000));
//!     let session = harness.start("/data/notes", "sync://host/alice/notes");
//!     session.wait_for_state(SessionState::Bound).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use tidesync_session::SessionState;
}

pub use fixtures::*;
pub use generators::*;
