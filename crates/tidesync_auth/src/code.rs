//! Server and client error codes, and the taxonomy that drives session state.
//!
//! Codes share their numeric values with the object server so a raw integer
//! reported by the sync client can be mapped back with [`ErrorCode::from_i32`].
//! Any value that does not map lands in [`ErrorCode::Unknown`].

use std::fmt;

/// How a session reacts when an error with a given code arrives while bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Authentication handshake errors. These must never reach a bound
    /// session; seeing one there is an internal-consistency fault.
    AuthProtocol,
    /// Connection or framing errors the transport reconnects from by itself.
    Transient,
    /// Session errors that are fixed by fetching a new access token and
    /// binding again.
    Recoverable,
    /// Session or version errors that end the session.
    Fatal,
    /// Codes with no known meaning. Treated as fatal.
    Unrecognized,
}

impl ErrorCategory {
    /// Returns true if a bound session must stop when it sees this category.
    pub fn stops_session(&self) -> bool {
        matches!(
            self,
            ErrorCategory::AuthProtocol | ErrorCategory::Fatal | ErrorCategory::Unrecognized
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::AuthProtocol => "auth-protocol",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Recoverable => "recoverable",
            ErrorCategory::Fatal => "fatal",
            ErrorCategory::Unrecognized => "unrecognized",
        };
        f.write_str(name)
    }
}

/// Error codes known to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Unmapped or missing code.
    Unknown,

    // Client side
    /// No response from the server (network or I/O failure).
    IoError,
    /// Response could not be parsed.
    JsonError,

    // Connection level
    /// Connection closed (no error).
    ConnectionClosed,
    /// Other connection level error.
    OtherError,
    /// Unknown type of input message.
    UnknownMessage,
    /// Bad syntax in input message head.
    BadSyntax,
    /// Limits exceeded in input message.
    LimitsExceeded,
    /// Wrong protocol version.
    WrongProtocolVersion,
    /// Bad session identifier in input message.
    BadSessionIdent,
    /// Overlapping reuse of session identifier.
    ReuseOfSessionIdent,
    /// Client file bound in other session.
    BoundInOtherSession,
    /// Bad input message order.
    BadMessageOrder,
    /// Error in decompression.
    BadDecompression,
    /// Bad server version in changeset header.
    BadChangesetHeaderSyntax,
    /// Bad size specified in changeset header.
    BadChangesetSize,
    /// Bad changesets in upload.
    BadChangesets,

    // Session level
    /// Session closed (no error).
    SessionClosed,
    /// Other session level error.
    OtherSessionError,
    /// Access token expired.
    TokenExpired,
    /// Bad user authentication.
    BadAuthentication,
    /// Illegal remote path.
    IllegalRealmPath,
    /// No such remote resource.
    NoSuchPath,
    /// Permission denied.
    PermissionDenied,
    /// Bad server file identifier.
    BadServerFileIdent,
    /// Bad client file identifier.
    BadClientFileIdent,
    /// Bad server version.
    BadServerVersion,
    /// Bad client version.
    BadClientVersion,
    /// Diverging histories.
    DivergingHistories,
    /// Bad changeset.
    BadChangeset,
    /// Disabled session.
    DisabledSession,
    /// Partial sync disabled.
    PartialSyncDisabled,
    /// Unsupported session-level feature.
    UnsupportedSessionFeature,
    /// Bad origin file identifier.
    BadOriginFileIdent,
    /// Synchronization no longer possible for client-side file.
    BadClientFile,
    /// Server file was deleted while bound.
    ServerFileDeleted,
    /// Client file has been blacklisted.
    ClientFileBlacklisted,
    /// User has been blacklisted.
    UserBlacklisted,
    /// Serialized transaction before upload completion.
    TransactBeforeUpload,
    /// Client file has expired.
    ClientFileExpired,
    /// User mismatch for client file identifier.
    UserMismatch,
    /// Too many sessions in connection.
    TooManySessions,
    /// Invalid schema change.
    InvalidSchemaChange,

    // Authentication server
    /// Request parameters were invalid.
    InvalidParameters,
    /// Request parameters were missing.
    MissingParameters,
    /// Wrong user name or password.
    InvalidCredentials,
    /// Account does not exist.
    UnknownAccount,
    /// Account already exists.
    ExistingAccount,
    /// Access to the resource was denied.
    AccessDenied,
    /// Refresh token is no longer valid.
    ExpiredRefreshToken,
}

/// Every code with a numeric value, used for lookups.
const CODE_TABLE: &[(ErrorCode, i32)] = &[
    (ErrorCode::Unknown, -1),
    (ErrorCode::IoError, 1),
    (ErrorCode::JsonError, 2),
    (ErrorCode::ConnectionClosed, 100),
    (ErrorCode::OtherError, 101),
    (ErrorCode::UnknownMessage, 102),
    (ErrorCode::BadSyntax, 103),
    (ErrorCode::LimitsExceeded, 104),
    (ErrorCode::WrongProtocolVersion, 105),
    (ErrorCode::BadSessionIdent, 106),
    (ErrorCode::ReuseOfSessionIdent, 107),
    (ErrorCode::BoundInOtherSession, 108),
    (ErrorCode::BadMessageOrder, 109),
    (ErrorCode::BadDecompression, 110),
    (ErrorCode::BadChangesetHeaderSyntax, 111),
    (ErrorCode::BadChangesetSize, 112),
    (ErrorCode::BadChangesets, 113),
    (ErrorCode::SessionClosed, 200),
    (ErrorCode::OtherSessionError, 201),
    (ErrorCode::TokenExpired, 202),
    (ErrorCode::BadAuthentication, 203),
    (ErrorCode::IllegalRealmPath, 204),
    (ErrorCode::NoSuchPath, 205),
    (ErrorCode::PermissionDenied, 206),
    (ErrorCode::BadServerFileIdent, 207),
    (ErrorCode::BadClientFileIdent, 208),
    (ErrorCode::BadServerVersion, 209),
    (ErrorCode::BadClientVersion, 210),
    (ErrorCode::DivergingHistories, 211),
    (ErrorCode::BadChangeset, 212),
    (ErrorCode::DisabledSession, 213),
    (ErrorCode::PartialSyncDisabled, 214),
    (ErrorCode::UnsupportedSessionFeature, 215),
    (ErrorCode::BadOriginFileIdent, 216),
    (ErrorCode::BadClientFile, 217),
    (ErrorCode::ServerFileDeleted, 218),
    (ErrorCode::ClientFileBlacklisted, 219),
    (ErrorCode::UserBlacklisted, 220),
    (ErrorCode::TransactBeforeUpload, 221),
    (ErrorCode::ClientFileExpired, 222),
    (ErrorCode::UserMismatch, 223),
    (ErrorCode::TooManySessions, 224),
    (ErrorCode::InvalidSchemaChange, 225),
    (ErrorCode::InvalidParameters, 600),
    (ErrorCode::MissingParameters, 601),
    (ErrorCode::InvalidCredentials, 611),
    (ErrorCode::UnknownAccount, 612),
    (ErrorCode::ExistingAccount, 613),
    (ErrorCode::AccessDenied, 614),
    (ErrorCode::ExpiredRefreshToken, 615),
];

/// Problem-type slugs used in the `type` field of server error bodies.
const PROBLEM_TYPES: &[(&str, ErrorCode)] = &[
    ("invalid-parameters", ErrorCode::InvalidParameters),
    ("missing-parameters", ErrorCode::MissingParameters),
    ("invalid-credentials", ErrorCode::InvalidCredentials),
    ("unknown-account", ErrorCode::UnknownAccount),
    ("existing-account", ErrorCode::ExistingAccount),
    ("access-denied", ErrorCode::AccessDenied),
    ("expired-refresh-token", ErrorCode::ExpiredRefreshToken),
];

impl ErrorCode {
    /// Maps a raw integer to a code. Unmapped values return `Unknown`.
    pub fn from_i32(raw: i32) -> Self {
        CODE_TABLE
            .iter()
            .find(|(_, value)| *value == raw)
            .map(|(code, _)| *code)
            .unwrap_or(ErrorCode::Unknown)
    }

    /// Maps a server problem type (a URL or bare slug) to a code.
    ///
    /// Only the last path segment is considered, so both
    /// `https://host/problems/invalid-credentials` and `invalid-credentials`
    /// map to [`ErrorCode::InvalidCredentials`].
    pub fn from_problem_type(problem_type: &str) -> Self {
        let slug = problem_type
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(problem_type);
        PROBLEM_TYPES
            .iter()
            .find(|(name, _)| *name == slug)
            .map(|(_, code)| *code)
            .unwrap_or(ErrorCode::Unknown)
    }

    /// Returns the numeric value of this code.
    pub fn as_i32(&self) -> i32 {
        CODE_TABLE
            .iter()
            .find(|(code, _)| code == self)
            .map(|(_, value)| *value)
            .unwrap_or(-1)
    }

    /// Classifies the code into the bucket a bound session acts on.
    pub fn category(&self) -> ErrorCategory {
        use ErrorCode::*;
        match self {
            Unknown => ErrorCategory::Unrecognized,

            IoError | JsonError | InvalidParameters | MissingParameters | InvalidCredentials
            | UnknownAccount | ExistingAccount | AccessDenied | ExpiredRefreshToken => {
                ErrorCategory::AuthProtocol
            }

            ConnectionClosed | OtherError | UnknownMessage | BadSyntax | LimitsExceeded
            | BadSessionIdent | ReuseOfSessionIdent | BoundInOtherSession | BadMessageOrder
            | BadDecompression | BadChangesetHeaderSyntax | BadChangesetSize | BadChangesets
            | SessionClosed | OtherSessionError => ErrorCategory::Transient,

            TokenExpired => ErrorCategory::Recoverable,

            WrongProtocolVersion | BadAuthentication | IllegalRealmPath | NoSuchPath
            | PermissionDenied | BadServerFileIdent | BadClientFileIdent | BadServerVersion
            | BadClientVersion | DivergingHistories | BadChangeset | DisabledSession
            | PartialSyncDisabled | UnsupportedSessionFeature | BadOriginFileIdent
            | BadClientFile | ServerFileDeleted | ClientFileBlacklisted | UserBlacklisted
            | TransactBeforeUpload | ClientFileExpired | UserMismatch | TooManySessions
            | InvalidSchemaChange => ErrorCategory::Fatal,
        }
    }

    /// Returns true for codes whose bucket is a judgement call.
    ///
    /// `BadChangesets` (upload framing) is transient while the closely
    /// related `BadChangeset` is fatal, and `OtherSessionError` carries no
    /// information at all.
    ///
    /// `IoError` and `JsonError` are raised by this client for failed
    /// authentication requests, so they sit in the auth-protocol bucket. A
    /// sync client reporting one to a bound session stops it.
    ///
    /// These are logged whenever they are classified.
    pub fn has_ambiguous_category(&self) -> bool {
        matches!(
            self,
            ErrorCode::BadChangesets
                | ErrorCode::BadChangeset
                | ErrorCode::OtherSessionError
                | ErrorCode::IoError
                | ErrorCode::JsonError
        )
    }

    /// Returns true if the error invalidates the user's login entirely.
    ///
    /// Retrying does not help; the caller has to log in again.
    pub fn is_user_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidCredentials
                | ErrorCode::UnknownAccount
                | ErrorCode::AccessDenied
                | ErrorCode::ExpiredRefreshToken
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_lookup_round_trips_table() {
        for (code, raw) in CODE_TABLE {
            assert_eq!(ErrorCode::from_i32(*raw), *code);
            assert_eq!(code.as_i32(), *raw);
        }
        assert_eq!(ErrorCode::from_i32(4242), ErrorCode::Unknown);
    }

    #[test]
    fn taxonomy_buckets() {
        assert_eq!(ErrorCode::ConnectionClosed.category(), ErrorCategory::Transient);
        assert_eq!(ErrorCode::UnknownMessage.category(), ErrorCategory::Transient);
        assert_eq!(ErrorCode::BadMessageOrder.category(), ErrorCategory::Transient);
        assert_eq!(ErrorCode::TokenExpired.category(), ErrorCategory::Recoverable);
        assert_eq!(ErrorCode::PermissionDenied.category(), ErrorCategory::Fatal);
        assert_eq!(ErrorCode::DivergingHistories.category(), ErrorCategory::Fatal);
        assert_eq!(ErrorCode::BadClientVersion.category(), ErrorCategory::Fatal);
        assert_eq!(ErrorCode::BadServerVersion.category(), ErrorCategory::Fatal);
        assert_eq!(ErrorCode::BadChangeset.category(), ErrorCategory::Fatal);
        assert_eq!(ErrorCode::InvalidParameters.category(), ErrorCategory::AuthProtocol);
        assert_eq!(ErrorCode::Unknown.category(), ErrorCategory::Unrecognized);
    }

    #[test]
    fn stopping_categories() {
        assert!(ErrorCategory::Fatal.stops_session());
        assert!(ErrorCategory::AuthProtocol.stops_session());
        assert!(ErrorCategory::Unrecognized.stops_session());
        assert!(!ErrorCategory::Transient.stops_session());
        assert!(!ErrorCategory::Recoverable.stops_session());
    }

    #[test]
    fn problem_type_slugs() {
        assert_eq!(
            ErrorCode::from_problem_type("https://auth.example.com/problems/invalid-credentials"),
            ErrorCode::InvalidCredentials
        );
        assert_eq!(
            ErrorCode::from_problem_type("expired-refresh-token"),
            ErrorCode::ExpiredRefreshToken
        );
        assert_eq!(ErrorCode::from_problem_type("teapot"), ErrorCode::Unknown);
    }

    #[test]
    fn client_side_codes_are_flagged() {
        for code in [ErrorCode::IoError, ErrorCode::JsonError] {
            assert_eq!(code.category(), ErrorCategory::AuthProtocol);
            assert!(code.has_ambiguous_category());
        }
        assert!(!ErrorCode::InvalidParameters.has_ambiguous_category());
        assert!(!ErrorCode::PermissionDenied.has_ambiguous_category());
    }

    #[test]
    fn user_fatal_codes() {
        assert!(ErrorCode::InvalidCredentials.is_user_fatal());
        assert!(ErrorCode::ExpiredRefreshToken.is_user_fatal());
        assert!(!ErrorCode::ExistingAccount.is_user_fatal());
        assert!(!ErrorCode::TokenExpired.is_user_fatal());
    }
}
