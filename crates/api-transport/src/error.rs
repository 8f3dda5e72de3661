//! Error types for transport operations

/// Errors surfaced to callers of `AuthenticatedTransport`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The 401-triggered refresh failed; the original 401 is not returned.
    #[error("session refresh failed: {0}")]
    Refresh(#[from] session_auth::Error),

    /// Non-success status. A 401 here means the retry was also rejected.
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl Error {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the caller should treat the session as gone (force logout).
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Error::Refresh(_)) || self.status() == Some(401)
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_display_includes_code_and_body() {
        let err = Error::Status {
            status: 503,
            body: "maintenance".into(),
        };
        assert_eq!(err.to_string(), "server returned 503: maintenance");
        assert_eq!(err.status(), Some(503));
        assert!(!err.is_session_lost());
    }

    #[test]
    fn refresh_failures_and_retried_401_lose_the_session() {
        assert!(Error::from(session_auth::Error::NoRefreshToken).is_session_lost());
        assert!(
            Error::Status {
                status: 401,
                body: String::new()
            }
            .is_session_lost()
        );
        assert!(!Error::Http("connection reset".into()).is_session_lost());
    }
}
