//! Login credentials.

use crate::error::{AuthError, AuthResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Extra key holding the password for the password provider.
pub const PASSWORD_KEY: &str = "password";

/// Extra key holding the registration flag for the password provider.
pub const REGISTER_KEY: &str = "register";

/// Identity provider a login attempt goes through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityProvider {
    /// User name and password managed by the authentication server.
    Password,
    /// Facebook access token.
    Facebook,
    /// A provider configured on the server under the given name.
    Custom(String),
    /// Development-only provider that trusts the identifier.
    Debug,
}

impl IdentityProvider {
    /// Parses a provider name as it appears on the wire.
    ///
    /// Names other than the built-in ones are custom providers; an empty
    /// name is rejected.
    pub fn from_name(name: &str) -> AuthResult<Self> {
        match name {
            "" => Err(AuthError::InvalidArgument(
                "identity provider name must be non-empty".into(),
            )),
            "password" => Ok(IdentityProvider::Password),
            "facebook" => Ok(IdentityProvider::Facebook),
            "debug" => Ok(IdentityProvider::Debug),
            other => Ok(IdentityProvider::Custom(other.to_string())),
        }
    }

    /// Returns the provider name used on the wire.
    pub fn name(&self) -> &str {
        match self {
            IdentityProvider::Password => "password",
            IdentityProvider::Facebook => "facebook",
            IdentityProvider::Custom(name) => name,
            IdentityProvider::Debug => "debug",
        }
    }

    /// Returns true if a person has to supply the identifier.
    pub fn is_interactive(&self) -> bool {
        !matches!(self, IdentityProvider::Debug)
    }
}

impl fmt::Display for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable description of one login attempt.
///
/// Credentials are validated when constructed, so holding one means the
/// identifier is usable for its provider.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    provider: IdentityProvider,
    identifier: String,
    extras: BTreeMap<String, Value>,
}

impl Credentials {
    /// Creates credentials for an arbitrary provider.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidArgument`] if the identifier is blank for
    /// an interactive provider, or if a custom provider has no name.
    pub fn new(
        provider: IdentityProvider,
        identifier: impl Into<String>,
        extras: BTreeMap<String, Value>,
    ) -> AuthResult<Self> {
        let identifier = identifier.into();
        if let IdentityProvider::Custom(name) = &provider {
            if name.trim().is_empty() {
                return Err(AuthError::InvalidArgument(
                    "custom provider name must be non-empty".into(),
                ));
            }
        }
        if provider.is_interactive() && identifier.trim().is_empty() {
            return Err(AuthError::InvalidArgument(format!(
                "non-empty identifier required for provider '{}'",
                provider
            )));
        }
        Ok(Self {
            provider,
            identifier,
            extras,
        })
    }

    /// Creates password credentials.
    ///
    /// `create_user` asks the server to register the account if it does not
    /// exist yet.
    pub fn password(
        username: impl Into<String>,
        password: impl Into<String>,
        create_user: bool,
    ) -> AuthResult<Self> {
        let mut extras = BTreeMap::new();
        extras.insert(PASSWORD_KEY.to_string(), Value::String(password.into()));
        extras.insert(REGISTER_KEY.to_string(), Value::Bool(create_user));
        Self::new(IdentityProvider::Password, username, extras)
    }

    /// Creates Facebook credentials from an access token.
    pub fn facebook(access_token: impl Into<String>) -> AuthResult<Self> {
        Self::new(IdentityProvider::Facebook, access_token, BTreeMap::new())
    }

    /// Creates credentials for a custom provider.
    pub fn custom(
        provider: impl Into<String>,
        identifier: impl Into<String>,
        extras: BTreeMap<String, Value>,
    ) -> AuthResult<Self> {
        Self::new(IdentityProvider::Custom(provider.into()), identifier, extras)
    }

    /// Creates debug credentials. Only accepted by development servers.
    pub fn debug(identifier: impl Into<String>) -> Self {
        Self {
            provider: IdentityProvider::Debug,
            identifier: identifier.into(),
            extras: BTreeMap::new(),
        }
    }

    /// Returns the identity provider.
    pub fn provider(&self) -> &IdentityProvider {
        &self.provider
    }

    /// Returns the primary identifier (user name, provider token, ...).
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the provider-specific extras.
    pub fn extras(&self) -> &BTreeMap<String, Value> {
        &self.extras
    }

    /// Returns true if these credentials ask for the account to be created.
    pub fn wants_registration(&self) -> bool {
        self.extras
            .get(REGISTER_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// Passwords and provider tokens stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identifier = match self.provider {
            IdentityProvider::Password | IdentityProvider::Debug => self.identifier.as_str(),
            _ => "<redacted>",
        };
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("identifier", &identifier)
            .field("extras", &self.extras.keys().collect::<Vec<_>>())
            .finish()
    }
}
