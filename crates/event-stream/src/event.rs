//! Typed stream events and the subscriber-facing state

use serde_json::Value;

use crate::error::FrameError;
use crate::frame::RawFrame;

/// A decoded frame with a recognized event type.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Progress(Value),
    Result(Value),
    Error(Value),
}

impl StreamEvent {
    /// Decode one frame: fields, then JSON payload, then event type.
    ///
    /// `Ok(None)` means the frame carried nothing (blank or keepalive).
    pub fn decode(text: &str) -> Result<Option<Self>, FrameError> {
        let Some(frame) = RawFrame::parse(text)? else {
            return Ok(None);
        };
        Self::from_raw(frame).map(Some)
    }

    pub fn from_raw(frame: RawFrame) -> Result<Self, FrameError> {
        let payload: Value = serde_json::from_str(&frame.data)
            .map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        match frame.event.as_str() {
            "progress" => Ok(StreamEvent::Progress(payload)),
            "result" => Ok(StreamEvent::Result(payload)),
            "error" => Ok(StreamEvent::Error(payload)),
            _ => Err(FrameError::UnknownEvent(frame.event)),
        }
    }

    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Progress(_) => "progress",
            StreamEvent::Result(_) => "result",
            StreamEvent::Error(_) => "error",
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Progress(Value),
    /// `payload` is the full result object; `success` mirrors its `success`
    /// field and defaults to true when the field is absent.
    Result { success: bool, payload: Value },
    /// The server reported an error; carries its first message.
    Error(String),
    /// The connection failed.
    Failed(String),
    /// The stream ended without a result or error.
    Closed,
}

impl StreamUpdate {
    /// Whether this update ends the loading phase for good.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamUpdate::Progress(_))
    }
}

impl From<StreamEvent> for StreamUpdate {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Progress(payload) => StreamUpdate::Progress(payload),
            StreamEvent::Result(payload) => StreamUpdate::Result {
                success: payload
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
                payload,
            },
            StreamEvent::Error(payload) => StreamUpdate::Error(first_error_message(&payload)),
        }
    }
}

/// Error payloads come as a bare array, an object with an `errors` array,
/// or a single object with a `message`.
fn first_error_message(payload: &Value) -> String {
    let first = match payload {
        Value::Array(items) => items.first(),
        Value::Object(map) => map
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .or(Some(payload)),
        _ => Some(payload),
    };
    match first {
        Some(Value::String(message)) => message.clone(),
        Some(value) => value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        None => String::from("stream reported an error"),
    }
}

/// Folded view of a session's updates: what a dashboard would render.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamState {
    pub loading: bool,
    pub progress: Option<Value>,
    pub data: Option<Value>,
    pub success: Option<bool>,
    pub error: Option<String>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            loading: true,
            progress: None,
            data: None,
            success: None,
            error: None,
        }
    }
}

impl StreamState {
    pub fn apply(&mut self, update: &StreamUpdate) {
        match update {
            StreamUpdate::Progress(payload) => self.progress = Some(payload.clone()),
            StreamUpdate::Result { success, payload } => {
                self.data = Some(payload.get("data").unwrap_or(payload).clone());
                self.success = Some(*success);
                self.loading = false;
            }
            StreamUpdate::Error(message) | StreamUpdate::Failed(message) => {
                self.error = Some(message.clone());
                self.loading = false;
            }
            StreamUpdate::Closed => self.loading = false,
        }
    }
}
