//! Authentication response decoding.

use crate::code::ErrorCode;
use crate::error::{AuthError, AuthResult};
use crate::token::Token;
use serde::Deserialize;

/// Successful answer to a login or access-token request.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticateResponse {
    /// Identity of the authenticated user.
    pub identity: String,
    /// Remote path the access token is scoped to, if any.
    pub path: Option<String>,
    /// Access token, when one was issued.
    pub access_token: Option<Token>,
    /// Refresh token, when one was issued.
    pub refresh_token: Option<Token>,
}

impl AuthenticateResponse {
    /// Decodes a response from an HTTP status and body.
    ///
    /// # Errors
    ///
    /// Non-200 statuses become [`AuthError::Server`]; bodies that cannot be
    /// parsed become [`AuthError::MalformedResponse`].
    pub fn from_http(status: u16, body: &[u8]) -> AuthResult<Self> {
        if status != 200 {
            return Err(decode_server_error(status, body));
        }
        let wire: SuccessBody = serde_json::from_slice(body)
            .map_err(|e| AuthError::MalformedResponse(format!("invalid JSON: {}", e)))?;

        let identity = wire
            .identity
            .or_else(|| wire.refresh.as_ref().map(|t| t.identity().to_string()))
            .or_else(|| wire.token.as_ref().map(|t| t.identity().to_string()))
            .ok_or_else(|| AuthError::MalformedResponse("missing 'identity'".into()))?;

        if wire.token.is_none() && wire.refresh.is_none() {
            return Err(AuthError::MalformedResponse(
                "response contains neither 'token' nor 'refresh'".into(),
            ));
        }

        Ok(Self {
            identity,
            path: wire.path,
            access_token: wire.token,
            refresh_token: wire.refresh,
        })
    }

    /// Returns the access token or a malformed-response error.
    pub fn require_access_token(self) -> AuthResult<Token> {
        self.access_token
            .ok_or_else(|| AuthError::MalformedResponse("missing access token".into()))
    }

    /// Returns the refresh token or a malformed-response error.
    pub fn require_refresh_token(self) -> AuthResult<Token> {
        self.refresh_token
            .ok_or_else(|| AuthError::MalformedResponse("missing refresh token".into()))
    }
}

/// Successful answer to a refresh request.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshResponse {
    /// The renewed refresh token.
    pub refresh_token: Token,
}

impl RefreshResponse {
    /// Decodes a refresh response. Servers may return the renewed token under
    /// either `refresh` or `token`.
    pub fn from_http(status: u16, body: &[u8]) -> AuthResult<Self> {
        let response = AuthenticateResponse::from_http(status, body)?;
        let refresh_token = match (response.refresh_token, response.access_token) {
            (Some(token), _) | (None, Some(token)) => token,
            (None, None) => {
                return Err(AuthError::MalformedResponse("missing refresh token".into()))
            }
        };
        Ok(Self { refresh_token })
    }
}

#[derive(Debug, Deserialize)]
struct SuccessBody {
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    token: Option<Token>,
    #[serde(default)]
    refresh: Option<Token>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    problem_type: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    hint: Option<String>,
    #[serde(default)]
    code: Option<i32>,
}

fn decode_server_error(status: u16, body: &[u8]) -> AuthError {
    let wire: ErrorBody = match serde_json::from_slice(body) {
        Ok(wire) => wire,
        Err(e) => {
            return AuthError::MalformedResponse(format!(
                "status {} with unparseable body: {}",
                status, e
            ))
        }
    };

    let code = wire
        .code
        .map(ErrorCode::from_i32)
        .filter(|code| *code != ErrorCode::Unknown)
        .or_else(|| wire.problem_type.as_deref().map(ErrorCode::from_problem_type))
        .unwrap_or(ErrorCode::Unknown);

    let hint = wire
        .hint
        .or(wire.title)
        .unwrap_or_else(|| format!("HTTP status {}", status));

    AuthError::server(code, hint)
}
