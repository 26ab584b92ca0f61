//! Refresh and access tokens.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Expiry value used by tokens that never expire.
pub const NEVER_EXPIRES: i64 = i64::MAX;

/// Permission granted by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// May download changes.
    Download,
    /// May upload changes.
    Upload,
    /// May use the token to obtain other tokens.
    Refresh,
    /// May manage permissions of the resource.
    Manage,
}

/// An opaque credential with an expiry and a set of permissions.
///
/// Tokens are immutable and compared by value. A refresh token identifies
/// the logged-in user; an access token is scoped to one remote path.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "TokenWire", into = "TokenWire")]
pub struct Token {
    value: String,
    identity: String,
    path: Option<String>,
    expires_ms: i64,
    permissions: BTreeSet<Permission>,
}

impl Token {
    /// Creates a token.
    pub fn new(
        value: impl Into<String>,
        identity: impl Into<String>,
        path: Option<String>,
        expires_ms: i64,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        Self {
            value: value.into(),
            identity: identity.into(),
            path,
            expires_ms,
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Creates a token that never expires. Used with the debug provider.
    pub fn non_expiring(value: impl Into<String>, identity: impl Into<String>) -> Self {
        Self::new(
            value,
            identity,
            None,
            NEVER_EXPIRES,
            [Permission::Download, Permission::Upload, Permission::Refresh],
        )
    }

    /// Returns the opaque token value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the identity the token was issued to.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the remote path this token is scoped to, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns the expiry in milliseconds since the epoch.
    pub fn expires_ms(&self) -> i64 {
        self.expires_ms
    }

    /// Returns the granted permissions.
    pub fn permissions(&self) -> &BTreeSet<Permission> {
        &self.permissions
    }

    /// Returns true if the permission was granted.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Returns true if the token never expires.
    pub fn is_non_expiring(&self) -> bool {
        self.expires_ms == NEVER_EXPIRES
    }

    /// Returns true if the token is still valid at `now_ms`.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        now_ms < self.expires_ms
    }

    /// Time left until expiry, or `None` for a non-expiring token.
    ///
    /// Returns zero for tokens that have already expired.
    pub fn time_until_expiry(&self, now_ms: i64) -> Option<Duration> {
        if self.is_non_expiring() {
            return None;
        }
        let remaining = self.expires_ms.saturating_sub(now_ms).max(0);
        Some(Duration::from_millis(remaining as u64))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("identity", &self.identity)
            .field("path", &self.path)
            .field("expires_ms", &self.expires_ms)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

/// Token as it is laid out in JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenWire {
    token: String,
    token_data: TokenData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenData {
    identity: String,
    #[serde(default)]
    path: Option<String>,
    expires: i64,
    #[serde(default)]
    access: Vec<Permission>,
}

impl From<TokenWire> for Token {
    fn from(wire: TokenWire) -> Self {
        Token::new(
            wire.token,
            wire.token_data.identity,
            wire.token_data.path,
            wire.token_data.expires,
            wire.token_data.access,
        )
    }
}

impl From<Token> for TokenWire {
    fn from(token: Token) -> Self {
        TokenWire {
            token: token.value,
            token_data: TokenData {
                identity: token.identity,
                path: token.path,
                expires: token.expires_ms,
                access: token.permissions.into_iter().collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_is_strictly_before_expiry() {
        let token = Token::new("t", "alice", None, 1_000, [Permission::Download]);
        assert!(token.is_valid(999));
        assert!(!token.is_valid(1_000));
        assert!(!token.is_valid(1_001));
    }

    #[test]
    fn non_expiring_tokens_stay_valid() {
        let token = Token::non_expiring("t", "admin");
        assert!(token.is_valid(i64::MAX - 1));
        assert_eq!(token.time_until_expiry(0), None);
    }

    #[test]
    fn time_until_expiry_saturates() {
        let token = Token::new("t", "alice", None, 5_000, []);
        assert_eq!(token.time_until_expiry(2_000), Some(Duration::from_secs(3)));
        assert_eq!(token.time_until_expiry(9_000), Some(Duration::ZERO));
    }

    #[test]
    fn parses_json_shape() {
        let json = r#"{
            "token": "abc",
            "token_data": {
                "identity": "alice",
                "path": "/alice/notes",
                "expires": 1700000000000,
                "access": ["download", "upload"]
            }
        }"#;
        let token: Token = serde_json::from_str(json).unwrap();
        assert_eq!(token.value(), "abc");
        assert_eq!(token.identity(), "alice");
        assert_eq!(token.path(), Some("/alice/notes"));
        assert_eq!(token.expires_ms(), 1_700_000_000_000);
        assert!(token.has_permission(Permission::Upload));
        assert!(!token.has_permission(Permission::Manage));
    }

    #[test]
    fn null_path_and_missing_access() {
        let json = r#"{"token":"r","token_data":{"identity":"bob","path":null,"expires":9223372036854775807}}"#;
        let token: Token = serde_json::from_str(json).unwrap();
        assert_eq!(token.path(), None);
        assert!(token.is_non_expiring());
        assert!(token.permissions().is_empty());
    }

    #[test]
    fn equality_is_by_value() {
        let a = Token::new("t", "alice", None, 10, [Permission::Upload, Permission::Download]);
        let b = Token::new("t", "alice", None, 10, [Permission::Download, Permission::Upload]);
        assert_eq!(a, b);
        assert_ne!(a, Token::new("u", "alice", None, 10, []));
    }

    #[test]
    fn debug_output_hides_value() {
        let token = Token::new("super-secret", "alice", None, 10, []);
        assert!(!format!("{:?}", token).contains("super-secret"));
    }
}
