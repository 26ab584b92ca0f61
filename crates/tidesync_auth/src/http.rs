//! HTTP transport implementation.
//!
//! Sends JSON bodies to the authentication endpoint. The HTTP client itself
//! is abstracted via a trait so applications can plug in whatever stack they
//! already ship (reqwest, ureq, a platform HTTP API).

use crate::credentials::Credentials;
use crate::error::{AuthError, AuthResult};
use crate::request::AuthRequest;
use crate::response::{AuthenticateResponse, RefreshResponse};
use crate::token::Token;
use crate::transport::AuthenticationTransport;
use parking_lot::RwLock;
use tracing::debug;

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// HTTP client abstraction.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a JSON body.
    ///
    /// Returns `Err` only when no response was received at all.
    fn post_json(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String>;
}

/// HTTP-based authentication transport.
pub struct HttpAuthTransport<C: HttpClient> {
    app_id: String,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpAuthTransport<C> {
    /// Creates a transport that identifies itself with `app_id`.
    pub fn new(app_id: impl Into<String>, client: C) -> Self {
        Self {
            app_id: app_id.into(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the application id sent with every request.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn post(&self, endpoint: &str, request: &AuthRequest) -> AuthResult<HttpResponse> {
        if endpoint.is_empty() {
            return Err(AuthError::InvalidArgument(
                "authentication endpoint is not set".into(),
            ));
        }
        let body = request.to_json()?;
        debug!(endpoint, kind = ?request.kind(), "sending authentication request");

        let response = self.client.post_json(endpoint, body).map_err(|e| {
            *self.last_error.write() = Some(e.clone());
            AuthError::Transport(e)
        })?;

        *self.last_error.write() = None;
        Ok(response)
    }
}

impl<C: HttpClient> AuthenticationTransport for HttpAuthTransport<C> {
    fn authenticate_user(
        &self,
        credentials: &Credentials,
        endpoint: &str,
        create_if_missing: bool,
    ) -> AuthResult<AuthenticateResponse> {
        let request = AuthRequest::login(credentials, &self.app_id, create_if_missing)?;
        let response = self.post(endpoint, &request)?;
        AuthenticateResponse::from_http(response.status, &response.body)
    }

    fn authenticate_resource(
        &self,
        refresh_token: &Token,
        resource_path: &str,
        endpoint: &str,
    ) -> AuthResult<AuthenticateResponse> {
        let request = AuthRequest::access_token(refresh_token, resource_path, &self.app_id);
        let response = self.post(endpoint, &request)?;
        AuthenticateResponse::from_http(response.status, &response.body)
    }

    fn refresh(&self, refresh_token_value: &str, endpoint: &str) -> AuthResult<RefreshResponse> {
        let request = AuthRequest::refresh(refresh_token_value, &self.app_id);
        let response = self.post(endpoint, &request)?;
        RefreshResponse::from_http(response.status, &response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::ErrorCode;
    use parking_lot::Mutex;
    use serde_json::Value;

    /// Answers every request with a fixed response and remembers the bodies.
    struct CannedClient {
        response: Result<HttpResponse, String>,
        requests: Mutex<Vec<(String, Value)>>,
    }

    impl CannedClient {
        fn new(response: Result<HttpResponse, String>) -> Self {
            Self {
                response,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpClient for &CannedClient {
        fn post_json(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String> {
            let value: Value = serde_json::from_slice(&body).unwrap();
            self.requests.lock().push((url.to_string(), value));
            self.response.clone()
        }
    }

    const ENDPOINT: &str = "https://auth.example.com/auth";

    #[test]
    fn login_posts_encoded_request() {
        let body = r#"{"identity":"alice","refresh":{"token":"r","token_data":{"identity":"alice","expires":100,"access":["refresh"]}}}"#;
        let client = CannedClient::new(Ok(HttpResponse::new(200, body)));
        let transport = HttpAuthTransport::new("app-7", &client);

        let creds = Credentials::password("alice", "pw", false).unwrap();
        let response = transport.authenticate_user(&creds, ENDPOINT, true).unwrap();
        assert_eq!(response.identity, "alice");

        let requests = client.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, ENDPOINT);
        assert_eq!(requests[0].1["app_id"], "app-7");
        assert_eq!(requests[0].1["user_info"]["register"], true);
    }

    #[test]
    fn transport_failure_is_recorded() {
        let client = CannedClient::new(Err("connection refused".into()));
        let transport = HttpAuthTransport::new("app", &client);

        let err = transport.refresh("r", ENDPOINT).unwrap_err();
        assert_eq!(err, AuthError::Transport("connection refused".into()));
        assert_eq!(transport.last_error().as_deref(), Some("connection refused"));
    }

    #[test]
    fn server_errors_are_classified() {
        let body = r#"{"type":"https://x/problems/access-denied","hint":"no access","code":614}"#;
        let client = CannedClient::new(Ok(HttpResponse::new(403, body)));
        let transport = HttpAuthTransport::new("app", &client);

        let refresh = Token::new("r", "alice", None, 100, []);
        let err = transport
            .authenticate_resource(&refresh, "/alice/x", ENDPOINT)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessDenied);
        assert!(err.is_user_fatal());
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        let client = CannedClient::new(Err("unreachable".into()));
        let transport = HttpAuthTransport::new("app", &client);
        let err = transport.refresh("r", "").unwrap_err();
        assert!(matches!(err, AuthError::InvalidArgument(_)));
        assert!(client.requests.lock().is_empty());
    }
}
