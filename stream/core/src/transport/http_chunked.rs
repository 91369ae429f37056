//! Chunked HTTP Transport
//!
//! Reads a chunked response body of `data:` frames without asking for
//! `text/event-stream`, for endpoints and proxies that only speak plain
//! chunked HTTP. Framing is shared with [`super::sse::SseTransport`]. Unlike
//! it, this transport cannot resume: a reconnect re-issues the original
//! request.

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

/// Chunked-read transport over reqwest
pub struct HttpChunkedTransport {
    client: reqwest::Client,
    config: TransportConfig,
    state: StateCell,
    activity: ActivityClock,
    cancel: Option<CancellationToken>,
}

impl HttpChunkedTransport {
    /// Create a chunked transport
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the HTTP client cannot
    /// be built.
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
impl Transport for HttpChunkedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpChunked
    }

    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    async fn open(
        &mut self,
        request: &StreamRequest,
    ) -> Result<mpsc::Receiver<TransportResult>, TransportError> {
        self.close();
        self.state.set(TransportState::Connecting);
        tracing::debug!(endpoint = %request.endpoint, "Opening chunked stream");

        let response = match open_stream(&self.client, request, &self.config, "*/*").await {
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

        // Event ids are dropped: a reconnect replays the whole request
        EventReader {
            kind: TransportKind::HttpChunked,
            resumable: false,
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
            tracing::debug!("Chunked stream closed");
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

impl Drop for HttpChunkedTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::messages::Chunk;
    use crate::transport::frame::MAX_FRAME_SIZE;
    use crate::transport::TransportEvent;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(mut rx: mpsc::Receiver<TransportResult>) -> Vec<TransportResult> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_reads_frames_until_done() {
        let server = MockServer::start().await;
        let body = "data: {\"token\":\"Hel\"}\n\ndata: {\"token\":\"lo\"}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/plain"))
            .mount(&server)
            .await;

        let mut transport = HttpChunkedTransport::new(TransportConfig::default()).unwrap();
        let request = StreamRequest::new(format!("{}/chat", server.uri()), Vec::new());
        let rx = transport.open(&request).await.unwrap();

        let chunks: Vec<Chunk> = collect(rx)
            .await
            .into_iter()
            .map(|item| item.unwrap().chunk)
            .collect();
        assert_eq!(
            chunks,
            vec![
                Chunk::Token("Hel".into()),
                Chunk::Token("lo".into()),
                Chunk::Done
            ]
        );
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_crlf_keepalives_and_multiline_data() {
        let server = MockServer::start().await;
        let body = concat!(
            ": keep-alive\r\n\r\n",
            "id: 4\r\ndata: {\"token\":\r\ndata: \"ab\"}\r\n\r\n",
            "data: [DONE]\r\n\r\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/plain"))
            .mount(&server)
            .await;

        let mut transport = HttpChunkedTransport::new(TransportConfig::default()).unwrap();
        let rx = transport
            .open(&StreamRequest::new(server.uri(), Vec::new()))
            .await
            .unwrap();
        let events: Vec<TransportEvent> = collect(rx)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].chunk, Chunk::Token("ab".into()));
        assert_eq!(events[0].event_id, None);
        assert_eq!(events[1].chunk, Chunk::Done);
    }

    #[tokio::test]
    async fn test_oversized_event_is_protocol_error() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {{\"token\":\"{}\"}}\n\n",
            "x".repeat(MAX_FRAME_SIZE)
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/plain"))
            .mount(&server)
            .await;

        let mut transport = HttpChunkedTransport::new(TransportConfig::default()).unwrap();
        let rx = transport
            .open(&StreamRequest::new(server.uri(), Vec::new()))
            .await
            .unwrap();
        let items = collect(rx).await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(StreamError::Protocol(_))));
        assert_eq!(transport.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_non_success_status_fails_open() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let mut transport = HttpChunkedTransport::new(TransportConfig::default()).unwrap();
        let request = StreamRequest::new(server.uri(), Vec::new());
        let err = transport.open(&request).await.unwrap_err();

        assert_eq!(
            err,
            TransportError::HttpStatus {
                status: 429,
                body: "slow down".into(),
                retry_after: Some(7),
            }
        );
        assert_eq!(transport.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_truncated_body_reports_closed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("data: {\"token\":\"a\"}\n\n", "text/plain"),
            )
            .mount(&server)
            .await;

        let mut transport = HttpChunkedTransport::new(TransportConfig::default()).unwrap();
        let rx = transport
            .open(&StreamRequest::new(server.uri(), Vec::new()))
            .await
            .unwrap();
        let items = collect(rx).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().chunk, Chunk::Token("a".into()));
        assert_eq!(
            items[1],
            Err(StreamError::Transport(TransportError::ConnectionClosed))
        );
    }
}
