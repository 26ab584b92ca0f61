//! Error types for sessions.

use thiserror::Error;
use tidesync_auth::{AuthError, ErrorCategory, ErrorCode};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors a session, its user or its refresher can report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The local replica could not be attached.
    #[error("replica error: {0}")]
    Replica(String),

    /// The server reported a session or protocol error.
    #[error("protocol error {code} ({category}): {message}")]
    Protocol {
        /// Classified code.
        code: ErrorCode,
        /// Bucket the code falls into.
        category: ErrorCategory,
        /// Message from the server.
        message: String,
    },

    /// The server reported a code this client does not know.
    #[error("unrecognized error code {raw_code}: {message}")]
    Unrecognized {
        /// Code as received.
        raw_code: i32,
        /// Message from the server.
        message: String,
    },

    /// The user owning the session has logged out.
    #[error("user is logged out")]
    UserLoggedOut,

    /// No Tokio runtime is available to run background work.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The configuration cannot back a session.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A stored user could not be written or read back.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl SessionError {
    /// Creates a protocol error from a raw server code.
    ///
    /// Codes outside the known table become [`SessionError::Unrecognized`].
    pub fn protocol(raw_code: i32, message: impl Into<String>) -> Self {
        let code = ErrorCode::from_i32(raw_code);
        let message = message.into();
        if code == ErrorCode::Unknown {
            return Self::Unrecognized { raw_code, message };
        }
        Self::Protocol {
            code,
            category: code.category(),
            message,
        }
    }

    /// Returns the bucket this error falls into.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::Auth(err) => err.code().category(),
            SessionError::Protocol { category, .. } => *category,
            SessionError::Unrecognized { .. } => ErrorCategory::Unrecognized,
            SessionError::Replica(_) => ErrorCategory::Transient,
            SessionError::UserLoggedOut
            | SessionError::NoRuntime
            | SessionError::InvalidConfig(_)
            | SessionError::Persistence(_) => ErrorCategory::Fatal,
        }
    }

    /// Returns the error code, if the error carries one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SessionError::Auth(err) => Some(err.code()),
            SessionError::Protocol { code, .. } => Some(*code),
            SessionError::Unrecognized { .. } => Some(ErrorCode::Unknown),
            _ => None,
        }
    }

    /// Returns true if the owning user has to log in again.
    pub fn is_user_fatal(&self) -> bool {
        matches!(self, SessionError::Auth(err) if err.is_user_fatal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_classified() {
        let err = SessionError::protocol(206, "denied");
        assert_eq!(err.code(), Some(ErrorCode::PermissionDenied));
        assert_eq!(err.category(), ErrorCategory::Fatal);
        assert_eq!(err.to_string(), "protocol error PermissionDenied(206) (fatal): denied");
    }

    #[test]
    fn unknown_codes_are_unrecognized() {
        let err = SessionError::protocol(4711, "what");
        assert_eq!(
            err,
            SessionError::Unrecognized {
                raw_code: 4711,
                message: "what".into()
            }
        );
        assert_eq!(err.category(), ErrorCategory::Unrecognized);
    }

    #[test]
    fn auth_errors_convert() {
        let err: SessionError = AuthError::server(ErrorCode::InvalidCredentials, "nope").into();
        assert!(err.is_user_fatal());
        assert_eq!(err.category(), ErrorCategory::AuthProtocol);

        let err: SessionError = AuthError::Transport("offline".into()).into();
        assert!(!err.is_user_fatal());
        assert_eq!(err.code(), Some(ErrorCode::IoError));
    }
}
