//! Streaming subscription to the metrics endpoint
//!
//! `subscribe()` opens `GET /api/metrics?timePeriod=N` with the current
//! bearer token and returns a [`StreamSession`]. A background task reads the
//! body, decodes frames and forwards typed updates over a channel. Starting
//! a new subscription cancels the previous one; once a session is cancelled
//! no further updates are delivered from it.

use std::fmt::Display;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use session_auth::TokenManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::error::StreamError;
use crate::event::{StreamEvent, StreamUpdate};
use crate::frame::FrameDecoder;

pub const METRICS_STREAM_PATH: &str = "/api/metrics";

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Updates buffered between the reader task and the subscriber.
const UPDATE_BUFFER: usize = 64;

pub struct EventStreamConsumer {
    client: reqwest::Client,
    base_url: String,
    tokens: TokenManager,
    current: Mutex<Option<CancellationToken>>,
}

impl EventStreamConsumer {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, tokens: TokenManager) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            current: Mutex::new(None),
        }
    }

    /// Open a stream for `time_period`, cancelling any session this consumer
    /// started before. Must be called from within a tokio runtime.
    pub fn subscribe(&self, time_period: u32) -> StreamSession {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(cancel.clone()) {
            previous.cancel();
            debug!("cancelled previous stream session");
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let url = format!(
            "{}{}?timePeriod={}",
            self.base_url, METRICS_STREAM_PATH, time_period
        );
        let token = self
            .tokens
            .has_valid_access_token()
            .then(|| self.tokens.get_access_token())
            .flatten();

        let span = info_span!("stream_session", session = %id, time_period);
        tokio::spawn(
            run_session(self.client.clone(), url, token, tx, cancel.clone()).instrument(span),
        );

        StreamSession {
            id,
            updates: rx,
            cancel,
        }
    }
}

/// Handle to one open stream. Dropping it cancels the stream.
pub struct StreamSession {
    id: Uuid,
    updates: mpsc::Receiver<StreamUpdate>,
    cancel: CancellationToken,
}

impl StreamSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next update, or `None` once the stream has ended or been cancelled.
    pub async fn next(&mut self) -> Option<StreamUpdate> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let update = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            update = self.updates.recv() => update,
        };
        if self.cancel.is_cancelled() {
            return None;
        }
        update
    }

    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.updates.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this session from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_session(
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    tx: mpsc::Sender<StreamUpdate>,
    cancel: CancellationToken,
) {
    let Some(token) = token else {
        warn!("stream requested without a valid session");
        emit(&tx, &cancel, StreamUpdate::Failed(StreamError::NotAuthenticated.to_string())).await;
        return;
    };

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("stream cancelled before response");
            return;
        }
        opened = open(&client, &url, &token) => opened,
    };

    match opened {
        Ok(response) => {
            info!("stream opened");
            pump(response.bytes_stream(), &tx, &cancel).await;
        }
        Err(e) => {
            warn!(error = %e, "stream failed to open");
            emit(&tx, &cancel, StreamUpdate::Failed(e.to_string())).await;
        }
    }
}

async fn open(
    client: &reqwest::Client,
    url: &str,
    token: &str,
) -> Result<reqwest::Response, StreamError> {
    let response = client
        .get(url)
        .bearer_auth(token)
        .header(ACCEPT, EVENT_STREAM_MIME)
        .send()
        .await
        .map_err(|e| StreamError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StreamError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Drive a byte stream to completion, forwarding decoded updates to `tx`.
///
/// Stops silently on cancellation or when the receiver goes away. A read
/// error is reported once as `Failed`. If the stream ends before a result
/// or error arrived, `Closed` is sent.
pub async fn pump<S, E>(stream: S, tx: &mpsc::Sender<StreamUpdate>, cancel: &CancellationToken)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = FrameDecoder::new();
    let mut terminal = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("stream cancelled mid-read");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                for frame in decoder.push(&chunk) {
                    if !dispatch(&frame, tx, cancel, &mut terminal).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                if cancel.is_cancelled() {
                    return;
                }
                let err = StreamError::Http(e.to_string());
                warn!(error = %err, "stream read failed");
                emit(tx, cancel, StreamUpdate::Failed(err.to_string())).await;
                return;
            }
            None => break,
        }
    }

    if let Some(rest) = decoder.finish() {
        if !dispatch(&rest, tx, cancel, &mut terminal).await {
            return;
        }
    }
    if !terminal {
        debug!("stream ended without a result");
        emit(tx, cancel, StreamUpdate::Closed).await;
    }
}

/// Decode and forward one frame. Returns false when the session is over.
async fn dispatch(
    frame: &str,
    tx: &mpsc::Sender<StreamUpdate>,
    cancel: &CancellationToken,
    terminal: &mut bool,
) -> bool {
    let event = match StreamEvent::decode(frame) {
        Ok(Some(event)) => event,
        Ok(None) => return true,
        Err(e) => {
            warn!(error = %e, "dropping stream frame");
            metrics::counter!("stream_frames_dropped_total", "reason" => e.reason()).increment(1);
            return true;
        }
    };

    metrics::counter!("stream_events_total", "type" => event.kind()).increment(1);
    let update = StreamUpdate::from(event);
    *terminal |= update.is_terminal();
    emit(tx, cancel, update).await
}

async fn emit(
    tx: &mpsc::Sender<StreamUpdate>,
    cancel: &CancellationToken,
    update: StreamUpdate,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(update) => sent.is_ok(),
    }
}
