//! Error types for authentication.

use crate::code::ErrorCode;
use thiserror::Error;

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors that can occur while authenticating.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// The caller passed something unusable (blank identifier, unknown
    /// provider, missing endpoint).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No response from the server.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with something that could not be parsed.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The server rejected the request.
    #[error("server error {code}: {hint}")]
    Server {
        /// Classified server code.
        code: ErrorCode,
        /// Human-readable hint from the server.
        hint: String,
    },
}

impl AuthError {
    /// Creates a server error.
    pub fn server(code: ErrorCode, hint: impl Into<String>) -> Self {
        Self::Server {
            code,
            hint: hint.into(),
        }
    }

    /// Returns the error code that best describes this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::InvalidArgument(_) => ErrorCode::InvalidParameters,
            AuthError::Transport(_) => ErrorCode::IoError,
            AuthError::MalformedResponse(_) => ErrorCode::JsonError,
            AuthError::Server { code, .. } => *code,
        }
    }

    /// Returns true if trying again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::Transport(_) | AuthError::MalformedResponse(_) => true,
            AuthError::Server { code, .. } => !code.is_user_fatal(),
            AuthError::InvalidArgument(_) => false,
        }
    }

    /// Returns true if the user's login is no longer usable.
    pub fn is_user_fatal(&self) -> bool {
        matches!(self, AuthError::Server { code, .. } if code.is_user_fatal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(AuthError::Transport("connection reset".into()).is_retryable());
        assert!(AuthError::MalformedResponse("eof".into()).is_retryable());
        assert!(!AuthError::InvalidArgument("blank".into()).is_retryable());
        assert!(!AuthError::server(ErrorCode::ExpiredRefreshToken, "expired").is_retryable());
        assert!(AuthError::server(ErrorCode::MissingParameters, "path").is_retryable());
    }

    #[test]
    fn codes_for_client_side_errors() {
        assert_eq!(AuthError::Transport("x".into()).code(), ErrorCode::IoError);
        assert_eq!(AuthError::MalformedResponse("x".into()).code(), ErrorCode::JsonError);
    }

    #[test]
    fn error_display() {
        let err = AuthError::server(ErrorCode::InvalidCredentials, "wrong password");
        assert_eq!(err.to_string(), "server error InvalidCredentials(611): wrong password");
        assert!(err.is_user_fatal());
    }
}
