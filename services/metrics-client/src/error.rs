//! Client-level error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no password configured: set METRICS_PASSWORD or session.password_file")]
    MissingPassword,

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error(transparent)]
    Api(#[from] api_transport::Error),

    #[error("metrics stream failed: {0}")]
    Stream(String),
}

/// Result alias using client Error
pub type Result<T> = std::result::Result<T, Error>;
