//! Server-Sent Events Transport
//!
//! POSTs the conversation and reads the response as an event stream. Event
//! framing is handled by `eventsource-stream`; each event's `data` is handed
//! to [`decode_payload`](super::frame::decode_payload) unless it is the
//! `[DONE]` sentinel.
//!
//! Event ids travel with each chunk so the manager can reconnect with
//! `Last-Event-ID` instead of replaying the whole answer.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

use super::config::{TransportConfig, TransportKind};
use super::http::{build_client, open_stream, EventReader};
use super::traits::{
    ActivityClock, StateCell, StreamRequest, Transport, TransportResult, TransportState,
};

/// SSE transport over reqwest
pub struct SseTransport {
    client: reqwest::Client,
    config: TransportConfig,
    state: StateCell,
    activity: ActivityClock,
    cancel: Option<CancellationToken>,
}

impl SseTransport {
    /// Create an SSE transport
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the HTTP client cannot
    /// be built (TLS backend initialization).
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(&config)?,
            config,
            state: StateCell::new(),
            activity: ActivityClock::default(),
            cancel: None,
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    fn supports_resume(&self) -> bool {
        true
    }

    async fn open(
        &mut self,
        request: &StreamRequest,
    ) -> Result<mpsc::Receiver<TransportResult>, TransportError> {
        self.close();
        self.state.set(TransportState::Connecting);
        tracing::debug!(
            endpoint = %request.endpoint,
            resume_from = ?request.resume_from,
            "Opening SSE stream"
        );

        let response = match open_stream(&self.client, request, &self.config, "text/event-stream")
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.state.set(TransportState::Failed);
                return Err(e);
            }
        };

        self.state.set(TransportState::Open);
        self.activity.touch();

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        EventReader {
            kind: TransportKind::Sse,
            resumable: true,
            tx,
            cancel,
            state: self.state.clone(),
            activity: self.activity.clone(),
        }
        .spawn(response);

        Ok(rx)
    }

    fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            tracing::debug!("SSE stream closed");
        }
        if self.state.get().is_active() {
            self.state.set(TransportState::Closed);
        }
    }

    fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    fn recycle(&mut self) {
        self.close();
        self.state.set(TransportState::Idle);
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.close();
    }
}
