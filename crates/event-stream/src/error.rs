//! Error types for stream framing and transport

/// A frame that cannot be turned into an event. Recovered locally: the
/// frame is dropped and the stream continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame has no event field")]
    MissingEvent,

    #[error("frame has no data field")]
    MissingData,

    #[error("frame payload is not JSON: {0}")]
    InvalidJson(String),

    #[error("unknown event type: {0}")]
    UnknownEvent(String),
}

impl FrameError {
    /// Metric label for dropped-frame accounting.
    pub fn reason(&self) -> &'static str {
        match self {
            FrameError::MissingEvent => "missing_event",
            FrameError::MissingData => "missing_data",
            FrameError::InvalidJson(_) => "invalid_json",
            FrameError::UnknownEvent(_) => "unknown_event",
        }
    }
}

/// Failure of the underlying connection. Surfaced once to the subscriber;
/// deliberate cancellation is never reported as one of these.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("user is not authenticated")]
    NotAuthenticated,

    #[error("stream request returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stream connection failed: {0}")]
    Http(String),
}
