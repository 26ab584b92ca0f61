//! The logged-in user.

use crate::config::SyncEnvironment;
use crate::error::{SessionError, SessionResult};
use crate::refresher::{RefreshStatus, TokenRefresher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidesync_auth::{AuthenticationTransport, Credentials, Permission, Token, NEVER_EXPIRES};
use tracing::{debug, info};

/// What is stored to bring a user back after a restart.
///
/// Serialized as JSON by [`to_json`](Self::to_json). Access tokens are keyed
/// by resource URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// The user's identity.
    pub identity: String,
    /// Authentication endpoint, if the user talks to a server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    /// The refresh token.
    pub refresh_token: Token,
    /// Cached access tokens.
    #[serde(default)]
    pub access_tokens: BTreeMap<String, Token>,
}

impl UserRecord {
    /// Encodes the record as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Persistence`] if encoding fails.
    pub fn to_json(&self) -> SessionResult<String> {
        serde_json::to_string(self).map_err(|e| SessionError::Persistence(e.to_string()))
    }

    /// Decodes a record written by [`to_json`](Self::to_json).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Persistence`] if the JSON is malformed or the
    /// identity does not match the refresh token.
    pub fn from_json(json: &str) -> SessionResult<Self> {
        let record: Self =
            serde_json::from_str(json).map_err(|e| SessionError::Persistence(e.to_string()))?;
        if record.identity != record.refresh_token.identity() {
            return Err(SessionError::Persistence(format!(
                "identity {} does not own the stored refresh token",
                record.identity
            )));
        }
        Ok(record)
    }
}

/// A user holding a refresh token and the access tokens obtained with it.
///
/// The refresh token is renewed in the background by a [`TokenRefresher`].
/// A user restored without an authentication endpoint never talks to the
/// server and is issued non-expiring access tokens locally.
pub struct AuthenticatedUser {
    identity: String,
    auth_url: Option<String>,
    transport: Arc<dyn AuthenticationTransport>,
    refresher: TokenRefresher,
    access_tokens: RwLock<HashMap<String, Token>>,
    logged_out: AtomicBool,
    env: SyncEnvironment,
}

impl AuthenticatedUser {
    /// Logs a user in.
    ///
    /// This blocks on the transport. Async callers should run it with
    /// `tokio::task::spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns the authentication failure, or a malformed-response error if
    /// the server returned no refresh token.
    pub fn login(
        credentials: &Credentials,
        endpoint: &str,
        transport: Arc<dyn AuthenticationTransport>,
        env: SyncEnvironment,
    ) -> SessionResult<Arc<Self>> {
        let response = transport.authenticate_user(
            credentials,
            endpoint,
            credentials.wants_registration(),
        )?;
        let refresh_token = response.require_refresh_token()?;
        info!(identity = refresh_token.identity(), "user logged in");
        Ok(Self::restore(
            refresh_token,
            Some(endpoint.to_string()),
            transport,
            env,
        ))
    }

    /// Rebuilds a user from a stored refresh token.
    pub fn restore(
        refresh_token: Token,
        auth_url: Option<String>,
        transport: Arc<dyn AuthenticationTransport>,
        env: SyncEnvironment,
    ) -> Arc<Self> {
        let auth_url = auth_url.filter(|url| !url.trim().is_empty());
        let identity = refresh_token.identity().to_string();
        let refresher = TokenRefresher::new(
            refresh_token,
            auth_url.clone(),
            Arc::clone(&transport),
            env.clone(),
        );
        Arc::new(Self {
            identity,
            auth_url,
            transport,
            refresher,
            access_tokens: RwLock::new(HashMap::new()),
            logged_out: AtomicBool::new(false),
            env,
        })
    }

    /// Rebuilds a user from a stored record, cached access tokens included.
    ///
    /// Expired access tokens are dropped.
    pub fn from_record(
        record: UserRecord,
        transport: Arc<dyn AuthenticationTransport>,
        env: SyncEnvironment,
    ) -> Arc<Self> {
        let now = env.clock.now_ms();
        let user = Self::restore(record.refresh_token, record.auth_url, transport, env);
        for (resource_url, token) in record.access_tokens {
            if token.is_valid(now) {
                user.add_access_token(resource_url, token);
            }
        }
        debug!(identity = %user.identity, "user restored from record");
        user
    }

    /// Returns what has to be stored to restore this user.
    pub fn to_record(&self) -> UserRecord {
        UserRecord {
            identity: self.identity.clone(),
            auth_url: self.auth_url.clone(),
            refresh_token: self.refresher.token(),
            access_tokens: self
                .access_tokens
                .read()
                .iter()
                .map(|(url, token)| (url.clone(), token.clone()))
                .collect(),
        }
    }

    /// Returns the user's identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the authentication endpoint, if any.
    pub fn auth_url(&self) -> Option<&str> {
        self.auth_url.as_deref()
    }

    /// Returns the current refresh token.
    pub fn refresh_token(&self) -> Token {
        self.refresher.token()
    }

    /// Returns the refresher renewing this user's token.
    pub fn refresher(&self) -> &TokenRefresher {
        &self.refresher
    }

    /// Returns the cached access token for a resource.
    pub fn access_token(&self, resource_url: &str) -> Option<Token> {
        self.access_tokens.read().get(resource_url).cloned()
    }

    /// Returns the cached access token for a resource if it is still valid.
    pub fn valid_access_token(&self, resource_url: &str) -> Option<Token> {
        let now = self.env.clock.now_ms();
        self.access_token(resource_url)
            .filter(|token| token.is_valid(now))
    }

    /// Caches an access token for a resource.
    pub fn add_access_token(&self, resource_url: impl Into<String>, token: Token) {
        if self.is_logged_out() {
            return;
        }
        self.access_tokens.write().insert(resource_url.into(), token);
    }

    /// Drops the cached access token for a resource.
    pub fn invalidate_access_token(&self, resource_url: &str) -> bool {
        self.access_tokens.write().remove(resource_url).is_some()
    }

    /// Obtains a fresh access token for a resource.
    ///
    /// This blocks on the transport.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UserLoggedOut`] after logout, or the
    /// authentication failure.
    pub fn authenticate_resource(&self, resource_url: &str) -> SessionResult<Token> {
        self.authenticate_resource_with(self.transport.as_ref(), resource_url)
    }

    /// Like [`authenticate_resource`](Self::authenticate_resource), through
    /// another transport.
    pub fn authenticate_resource_with(
        &self,
        transport: &dyn AuthenticationTransport,
        resource_url: &str,
    ) -> SessionResult<Token> {
        if !self.is_logged_in() {
            return Err(SessionError::UserLoggedOut);
        }
        let path = resource_path(resource_url);
        let refresh_token = self.refresher.token();

        let Some(endpoint) = self.auth_url.as_deref() else {
            debug!(identity = %self.identity, path, "issuing local access token");
            return Ok(Token::new(
                refresh_token.value(),
                self.identity.clone(),
                Some(path.to_string()),
                NEVER_EXPIRES,
                [Permission::Download, Permission::Upload],
            ));
        };

        let response = transport.authenticate_resource(&refresh_token, path, endpoint)?;
        Ok(response.require_access_token()?)
    }

    /// Returns true until the user logs out or the refresh token is
    /// rejected for good.
    pub fn is_logged_in(&self) -> bool {
        !self.is_logged_out() && !matches!(self.refresher.status(), RefreshStatus::Stopped(_))
    }

    fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// Logs the user out.
    ///
    /// Cancels background renewal and forgets every access token. Calling it
    /// again does nothing.
    ///
    /// Sessions owned by the user keep running; use
    /// [`SessionRegistry::logout`](crate::SessionRegistry::logout) to stop
    /// them first.
    pub fn logout(&self) {
        if self.logged_out.swap(true, Ordering::SeqCst) {
            return;
        }
        self.refresher.cancel();
        self.access_tokens.write().clear();
        info!(identity = %self.identity, "user logged out");
    }
}

impl std::fmt::Debug for AuthenticatedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedUser")
            .field("identity", &self.identity)
            .field("auth_url", &self.auth_url)
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}

/// Returns the path component of a resource URL.
///
/// `sync://host:7800/alice/notes` becomes `/alice/notes`. A value without a
/// scheme is returned unchanged.
pub fn resource_path(resource_url: &str) -> &str {
    let Some((_, rest)) = resource_url.split_once("://") else {
        return resource_url;
    };
    match rest.find('/') {
        Some(index) => &rest[index..],
        None => "/",
    }
}
