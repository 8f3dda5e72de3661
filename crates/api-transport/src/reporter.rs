//! Error-reporting collaborator
//!
//! The transport hands every failure to a reporter before returning it. The
//! default implementation logs through `tracing`; front ends can plug in
//! their own (toast notifications, crash reporting).

use tracing::{error, warn};

use crate::error::Error;

pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &Error);
}

/// Logs each reported error at a level matching its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, err: &Error) {
        match err {
            Error::Status { status, body } if *status >= 500 => {
                error!(status, body = %body, "API error")
            }
            Error::Status { status, body } => warn!(status, body = %body, "API request rejected"),
            Error::Refresh(e) => warn!(error = %e, "session refresh failed"),
            Error::Http(msg) => error!(error = %msg, "no response received"),
            Error::Decode(msg) => error!(error = %msg, "unreadable API response"),
            Error::InvalidRequest(msg) => error!(error = %msg, "error setting up request"),
            Error::Authentication(msg) => warn!(error = %msg, "authentication failed"),
        }
    }
}
