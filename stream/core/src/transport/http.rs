//! Shared HTTP plumbing for the SSE and chunked transports

use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, RETRY_AFTER};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{StreamError, TransportError};
use crate::messages::Chunk;

use super::config::{TransportConfig, TransportKind};
use super::frame::{decode_payload, DONE_SENTINEL};
use super::traits::{
    ActivityClock, StateCell, StreamRequest, TransportEvent, TransportResult, TransportState,
};

/// Longest error body kept from a rejected open
const MAX_ERROR_BODY: usize = 2048;

/// Build the HTTP client for a transport
pub(crate) fn build_client(config: &TransportConfig) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .build()
        .map_err(|e| TransportError::ConnectionFailed(format!("http client: {e}")))
}

/// POST the request and return the streaming response
///
/// Non-2xx responses become [`TransportError::HttpStatus`] carrying the body
/// and any `Retry-After` seconds.
pub(crate) async fn open_stream(
    client: &reqwest::Client,
    request: &StreamRequest,
    config: &TransportConfig,
    accept: &'static str,
) -> Result<reqwest::Response, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(accept));
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidState(format!("header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidState(format!("header value: {e}")))?;
        headers.insert(name, value);
    }
    if let Some(ref id) = request.resume_from {
        if let Ok(value) = HeaderValue::from_str(id) {
            headers.insert(HeaderName::from_static("last-event-id"), value);
        }
    }

    let response = client
        .post(&request.endpoint)
        .headers(headers)
        .json(&request.body())
        .send()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        return Err(TransportError::HttpStatus {
            status: status.as_u16(),
            body,
            retry_after,
        });
    }

    Ok(response)
}

/// Send an item unless the stream was cancelled
///
/// Returns false when the reader should stop: cancelled, or the receiver is
/// gone.
pub(crate) async fn deliver(
    tx: &mpsc::Sender<TransportResult>,
    cancel: &CancellationToken,
    item: TransportResult,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Reader task turning a response body into chunks
///
/// The body is framed with `eventsource-stream` and each event's data goes
/// through [`decode_payload`]. Event ids are forwarded only when the
/// transport can resume from them.
pub(crate) struct EventReader {
    pub(crate) kind: TransportKind,
    pub(crate) resumable: bool,
    pub(crate) tx: mpsc::Sender<TransportResult>,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: StateCell,
    pub(crate) activity: ActivityClock,
}

impl EventReader {
    pub(crate) fn spawn(self, response: reqwest::Response) {
        tokio::spawn(self.run(response));
    }

    async fn run(self, response: reqwest::Response) {
        let Self {
            kind,
            resumable,
            tx,
            cancel,
            state,
            activity,
        } = self;
        let mut events = response.bytes_stream().eventsource();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                next = events.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    let err = match e {
                        EventStreamError::Transport(e) => {
                            StreamError::Transport(TransportError::ReceiveFailed(e.to_string()))
                        }
                        other => StreamError::Protocol(other.to_string()),
                    };
                    tracing::warn!(transport = %kind, error = %err, "Stream read failed");
                    state.set(TransportState::Failed);
                    let _ = deliver(&tx, &cancel, Err(err)).await;
                    return;
                }
                None => {
                    tracing::debug!(transport = %kind, "Stream ended without [DONE]");
                    state.set(TransportState::Failed);
                    let _ = deliver(&tx, &cancel, Err(TransportError::ConnectionClosed.into()))
                        .await;
                    return;
                }
            };

            activity.touch();
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }

            let event_id = (resumable && !event.id.is_empty()).then(|| event.id.clone());

            if data == DONE_SENTINEL {
                state.set(TransportState::Closed);
                let done = TransportEvent {
                    chunk: Chunk::Done,
                    event_id,
                };
                let _ = deliver(&tx, &cancel, Ok(done)).await;
                return;
            }

            let chunks = match decode_payload(data) {
                Ok(chunks) => chunks,
                Err(e) => {
                    state.set(TransportState::Failed);
                    let _ = deliver(&tx, &cancel, Err(e)).await;
                    return;
                }
            };

            for chunk in chunks {
                let terminal = chunk.is_terminal();
                let item = TransportEvent {
                    chunk,
                    event_id: event_id.clone(),
                };
                if !deliver(&tx, &cancel, Ok(item)).await {
                    if !cancel.is_cancelled() {
                        state.set(TransportState::Closed);
                    }
                    return;
                }
                if terminal {
                    state.set(TransportState::Closed);
                    return;
                }
            }
        }
    }
}
