//! Authentication request encoding.
//!
//! Builds the JSON body for the three requests the client sends: the initial
//! login, an access-token request for one remote path, and refresh-token
//! renewal. Encoding is pure; nothing here touches the network.

use crate::credentials::{Credentials, IdentityProvider, PASSWORD_KEY, REGISTER_KEY};
use crate::error::{AuthError, AuthResult};
use crate::token::Token;
use serde::Serialize;
use serde_json::{Map, Value};

/// Provider name used when authenticating with an existing refresh token.
pub const REFRESH_TOKEN_PROVIDER: &str = "refresh_token";

/// Which of the three operations a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Initial login with credentials.
    Login,
    /// Access token for one remote path.
    AccessToken,
    /// Renewal of the refresh token.
    Refresh,
}

/// A request body for the authentication endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthRequest {
    #[serde(skip)]
    kind: RequestKind,
    provider: String,
    data: String,
    app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    user_info: Map<String, Value>,
}

impl AuthRequest {
    /// Builds a login request.
    ///
    /// For the password provider `create_if_missing` is merged with the
    /// registration flag carried by the credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidArgument`] for a custom provider without a
    /// name, or password credentials missing the password.
    pub fn login(
        credentials: &Credentials,
        app_id: &str,
        create_if_missing: bool,
    ) -> AuthResult<Self> {
        let user_info = match credentials.provider() {
            IdentityProvider::Password => {
                let password = credentials
                    .extras()
                    .get(PASSWORD_KEY)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AuthError::InvalidArgument("password credentials lack a password".into())
                    })?;
                let mut info = Map::new();
                info.insert(PASSWORD_KEY.into(), Value::String(password.to_string()));
                info.insert(
                    REGISTER_KEY.into(),
                    Value::Bool(credentials.wants_registration() || create_if_missing),
                );
                info
            }
            IdentityProvider::Facebook | IdentityProvider::Debug => Map::new(),
            IdentityProvider::Custom(name) => {
                if name.trim().is_empty() {
                    return Err(AuthError::InvalidArgument(
                        "unrecognized identity provider".into(),
                    ));
                }
                credentials
                    .extras()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            }
        };

        Ok(Self {
            kind: RequestKind::Login,
            provider: credentials.provider().name().to_string(),
            data: credentials.identifier().to_string(),
            app_id: app_id.to_string(),
            path: None,
            user_info,
        })
    }

    /// Builds a request for an access token scoped to `path`.
    pub fn access_token(refresh_token: &Token, path: &str, app_id: &str) -> Self {
        Self {
            kind: RequestKind::AccessToken,
            provider: REFRESH_TOKEN_PROVIDER.to_string(),
            data: refresh_token.value().to_string(),
            app_id: app_id.to_string(),
            path: Some(path.to_string()),
            user_info: Map::new(),
        }
    }

    /// Builds a refresh-token renewal request.
    pub fn refresh(refresh_token_value: &str, app_id: &str) -> Self {
        Self {
            kind: RequestKind::Refresh,
            provider: REFRESH_TOKEN_PROVIDER.to_string(),
            data: refresh_token_value.to_string(),
            app_id: app_id.to_string(),
            path: None,
            user_info: Map::new(),
        }
    }

    /// Returns which operation this request performs.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Returns the provider name.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Returns the target path, for access-token requests.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns the provider-specific fields.
    pub fn user_info(&self) -> &Map<String, Value> {
        &self.user_info
    }

    /// Encodes the request as a JSON value.
    pub fn to_value(&self) -> AuthResult<Value> {
        serde_json::to_value(self)
            .map_err(|e| AuthError::InvalidArgument(format!("failed to encode request: {}", e)))
    }

    /// Encodes the request as JSON bytes.
    pub fn to_json(&self) -> AuthResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| AuthError::InvalidArgument(format!("failed to encode request: {}", e)))
    }
}
