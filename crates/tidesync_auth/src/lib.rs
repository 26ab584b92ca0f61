//! # tidesync auth
//!
//! Authentication primitives for the tidesync client.
//!
//! This crate provides:
//! - [`Credentials`] describing a login attempt
//! - [`Token`] for refresh and access tokens
//! - [`ErrorCode`] and the [`ErrorCategory`] taxonomy sessions act on
//! - Request encoding and response decoding for the authentication endpoint
//! - The [`AuthenticationTransport`] abstraction, an HTTP implementation over
//!   an injectable [`HttpClient`], and a scripted [`MockAuthTransport`]
//!
//! Nothing in this crate retries or schedules work. Retry policy lives with
//! the callers in `tidesync_session`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod code;
mod credentials;
mod error;
mod http;
mod request;
mod response;
mod token;
mod transport;

pub use code::{ErrorCategory, ErrorCode};
pub use credentials::{Credentials, IdentityProvider, PASSWORD_KEY, REGISTER_KEY};
pub use error::{AuthError, AuthResult};
pub use http::{HttpAuthTransport, HttpClient, HttpResponse};
pub use request::{AuthRequest, RequestKind, REFRESH_TOKEN_PROVIDER};
pub use response::{AuthenticateResponse, RefreshResponse};
pub use token::{Permission, Token, NEVER_EXPIRES};
pub use transport::{AuthCall, AuthenticationTransport, MockAuthTransport};
