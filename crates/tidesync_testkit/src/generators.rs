//! Property-based test generators using proptest.
//!
//! Provides strategies for generating credentials, tokens and error codes
//! that satisfy the constructors' validation rules.

use proptest::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use tidesync_auth::{Credentials, ErrorCode, Permission, Token, NEVER_EXPIRES};

/// Every numeric code the client knows.
pub const KNOWN_CODES: &[i32] = &[
    1, 2, 100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 200, 201, 202,
    203, 204, 205, 206, 207, 208, 209, 210, 211, 212, 213, 214, 215, 216, 217, 218, 219, 220,
    221, 222, 223, 224, 225, 600, 601, 611, 612, 613, 614, 615,
];

/// Strategy for non-empty identifiers.
pub fn identifier_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9][a-zA-Z0-9._@-]{0,31}").expect("Invalid regex")
}

/// Strategy for password credentials.
pub fn password_credentials_strategy() -> impl Strategy<Value = Credentials> {
    (identifier_strategy(), "[ -~]{1,24}", any::<bool>()).prop_map(|(user, password, register)| {
        Credentials::password(user, password, register).expect("valid password credentials")
    })
}

/// Strategy for Facebook credentials.
pub fn facebook_credentials_strategy() -> impl Strategy<Value = Credentials> {
    identifier_strategy()
        .prop_map(|token| Credentials::facebook(token).expect("valid facebook credentials"))
}

/// Strategy for custom-provider credentials with string extras.
pub fn custom_credentials_strategy() -> impl Strategy<Value = Credentials> {
    (
        "[a-z]{3,12}".prop_filter("built-in provider name", |name| {
            !matches!(name.as_str(), "password" | "facebook" | "debug")
        }),
        identifier_strategy(),
        prop::collection::btree_map("[a-z_]{1,10}", "[a-z0-9]{0,10}", 0..4),
    )
        .prop_map(|(provider, identifier, extras)| {
            let extras: BTreeMap<String, Value> = extras
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect();
            Credentials::custom(provider, identifier, extras).expect("valid custom credentials")
        })
}

/// Strategy for debug credentials.
pub fn debug_credentials_strategy() -> impl Strategy<Value = Credentials> {
    identifier_strategy().prop_map(Credentials::debug)
}

/// Strategy for credentials of any provider.
pub fn credentials_strategy() -> impl Strategy<Value = Credentials> {
    prop_oneof![
        password_credentials_strategy(),
        facebook_credentials_strategy(),
        custom_credentials_strategy(),
        debug_credentials_strategy(),
    ]
}

/// Strategy for permission sets.
pub fn permissions_strategy() -> impl Strategy<Value = Vec<Permission>> {
    prop::collection::vec(
        prop_oneof![
            Just(Permission::Download),
            Just(Permission::Upload),
            Just(Permission::Refresh),
            Just(Permission::Manage),
        ],
        0..4,
    )
}

/// Strategy for expiring tokens.
pub fn token_strategy() -> impl Strategy<Value = Token> {
    (
        "[a-zA-Z0-9]{8,32}",
        identifier_strategy(),
        prop::option::of("/[a-z]{1,8}/[a-z]{1,8}"),
        0i64..NEVER_EXPIRES,
        permissions_strategy(),
    )
        .prop_map(|(value, identity, path, expires, permissions)| {
            Token::new(value, identity, path, expires, permissions)
        })
}

/// Strategy for codes the client knows.
pub fn known_code_strategy() -> impl Strategy<Value = ErrorCode> {
    prop::sample::select(KNOWN_CODES).prop_map(ErrorCode::from_i32)
}

/// Strategy for raw codes the client does not know.
pub fn unknown_raw_code_strategy() -> impl Strategy<Value = i32> {
    any::<i32>().prop_filter("code must be unknown", |raw| !KNOWN_CODES.contains(raw))
}
