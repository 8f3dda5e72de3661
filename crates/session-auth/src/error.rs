//! Error types for session credential operations

/// Errors from token decoding, storage and refresh.
///
/// `Clone` because a single refresh outcome is handed to every caller that
/// joined the in-flight refresh.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("refresh token rejected: {0}")]
    InvalidCredentials(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
