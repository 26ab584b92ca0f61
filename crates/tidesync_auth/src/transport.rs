//! Transport abstraction for authentication requests.

use crate::credentials::Credentials;
use crate::error::{AuthError, AuthResult};
use crate::response::{AuthenticateResponse, RefreshResponse};
use crate::token::Token;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Performs authentication calls against the remote directory service.
///
/// Implementations do not retry. Backoff and retry belong to the caller
/// (the token refresher, or the session state machine), which keeps the
/// policy testable without a network stack. Calls may block; async callers
/// run them on a blocking thread.
pub trait AuthenticationTransport: Send + Sync {
    /// Logs a user in with credentials.
    fn authenticate_user(
        &self,
        credentials: &Credentials,
        endpoint: &str,
        create_if_missing: bool,
    ) -> AuthResult<AuthenticateResponse>;

    /// Requests an access token for one remote path using a refresh token.
    fn authenticate_resource(
        &self,
        refresh_token: &Token,
        resource_path: &str,
        endpoint: &str,
    ) -> AuthResult<AuthenticateResponse>;

    /// Renews a refresh token.
    fn refresh(&self, refresh_token_value: &str, endpoint: &str) -> AuthResult<RefreshResponse>;
}

/// A call recorded by [`MockAuthTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum AuthCall {
    /// `authenticate_user` was called.
    AuthenticateUser {
        /// Identifier from the credentials.
        identifier: String,
        /// Endpoint the call targeted.
        endpoint: String,
        /// Whether the account should be created.
        create_if_missing: bool,
    },
    /// `authenticate_resource` was called.
    AuthenticateResource {
        /// Remote path an access token was requested for.
        resource_path: String,
        /// Endpoint the call targeted.
        endpoint: String,
    },
    /// `refresh` was called.
    Refresh {
        /// Endpoint the call targeted.
        endpoint: String,
    },
}

/// A scripted transport for testing.
///
/// Each operation pops the next queued result. An operation with nothing
/// queued fails with a transport error.
#[derive(Debug, Default)]
pub struct MockAuthTransport {
    user_results: Mutex<VecDeque<AuthResult<AuthenticateResponse>>>,
    resource_results: Mutex<VecDeque<AuthResult<AuthenticateResponse>>>,
    refresh_results: Mutex<VecDeque<AuthResult<RefreshResponse>>>,
    calls: Mutex<Vec<AuthCall>>,
}

impl MockAuthTransport {
    /// Creates a mock transport with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a result for `authenticate_user`.
    pub fn push_user_result(&self, result: AuthResult<AuthenticateResponse>) {
        self.user_results.lock().push_back(result);
    }

    /// Queues an access token for `authenticate_resource`.
    pub fn push_access_token(&self, token: Token) {
        let response = AuthenticateResponse {
            identity: token.identity().to_string(),
            path: token.path().map(str::to_string),
            access_token: Some(token),
            refresh_token: None,
        };
        self.resource_results.lock().push_back(Ok(response));
    }

    /// Queues a failure for `authenticate_resource`.
    pub fn push_resource_error(&self, error: AuthError) {
        self.resource_results.lock().push_back(Err(error));
    }

    /// Queues a renewed refresh token for `refresh`.
    pub fn push_refresh_token(&self, token: Token) {
        self.refresh_results.lock().push_back(Ok(RefreshResponse {
            refresh_token: token,
        }));
    }

    /// Queues a failure for `refresh`.
    pub fn push_refresh_error(&self, error: AuthError) {
        self.refresh_results.lock().push_back(Err(error));
    }

    /// Returns every call made so far, in order.
    pub fn calls(&self) -> Vec<AuthCall> {
        self.calls.lock().clone()
    }

    /// Returns how many `refresh` calls were made.
    pub fn refresh_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, AuthCall::Refresh { .. }))
            .count()
    }

    /// Returns how many `authenticate_resource` calls were made.
    pub fn resource_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, AuthCall::AuthenticateResource { .. }))
            .count()
    }

    fn not_scripted(operation: &str) -> AuthError {
        AuthError::Transport(format!("no mock {} response set", operation))
    }
}

impl AuthenticationTransport for MockAuthTransport {
    fn authenticate_user(
        &self,
        credentials: &Credentials,
        endpoint: &str,
        create_if_missing: bool,
    ) -> AuthResult<AuthenticateResponse> {
        self.calls.lock().push(AuthCall::AuthenticateUser {
            identifier: credentials.identifier().to_string(),
            endpoint: endpoint.to_string(),
            create_if_missing,
        });
        self.user_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Self::not_scripted("login")))
    }

    fn authenticate_resource(
        &self,
        _refresh_token: &Token,
        resource_path: &str,
        endpoint: &str,
    ) -> AuthResult<AuthenticateResponse> {
        self.calls.lock().push(AuthCall::AuthenticateResource {
            resource_path: resource_path.to_string(),
            endpoint: endpoint.to_string(),
        });
        self.resource_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Self::not_scripted("access token")))
    }

    fn refresh(&self, _refresh_token_value: &str, endpoint: &str) -> AuthResult<RefreshResponse> {
        self.calls.lock().push(AuthCall::Refresh {
            endpoint: endpoint.to_string(),
        });
        self.refresh_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Self::not_scripted("refresh")))
    }
}
