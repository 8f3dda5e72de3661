//! Consumer for chunked server-pushed event streams
//!
//! Opens one streaming HTTP request per subscription, decodes the body
//! incrementally, frames it on blank lines, and delivers typed updates
//! (progress / result / error) through a cancellable session handle.
//!
//! Frame-level problems (missing fields, bad JSON, unknown event types) are
//! logged and the frame is dropped; the stream keeps going. Transport
//! failures end the session with a single `StreamUpdate::Failed`.

pub mod consumer;
pub mod error;
pub mod event;
pub mod frame;

pub use consumer::{EventStreamConsumer, METRICS_STREAM_PATH, StreamSession, pump};
pub use error::{FrameError, StreamError};
pub use event::{StreamEvent, StreamState, StreamUpdate};
pub use frame::{FrameDecoder, RawFrame};
