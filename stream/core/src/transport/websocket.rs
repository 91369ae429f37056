//! WebSocket Transport
//!
//! Sends the request body as one text message and treats every text message
//! that comes back as a payload (`{"token": ...}`, `[DONE]`, ...). A leading
//! `data:` prefix is tolerated so endpoints can reuse their SSE encoder.
//!
//! # Kept-open connections
//!
//! After a clean `[DONE]` the socket goes back into a slot and the next open
//! to the same URL reuses it. The slot is taken out while a reader or a
//! health check uses the socket, so no lock is held across an await. A
//! cancelled read drops the socket since unread frames may still be in
//! flight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{StreamError, TransportError};
use crate::messages::Chunk;

use super::config::{websocket_url_for, TransportConfig, TransportKind};
use super::frame::{decode_payload, DONE_SENTINEL};
use super::http::deliver;
use super::traits::{
    ActivityClock, StateCell, StreamRequest, Transport, TransportEvent, TransportResult,
    TransportState,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Kept-open socket plus the URL it was opened for
struct Connection {
    url: String,
    stream: WsStream,
}

type Slot = Arc<Mutex<Option<Connection>>>;

/// WebSocket transport over tokio-tungstenite
pub struct WebSocketTransport {
    config: TransportConfig,
    state: StateCell,
    activity: ActivityClock,
    cancel: Option<CancellationToken>,
    slot: Slot,
}

impl WebSocketTransport {
    /// Create a WebSocket transport (connects lazily on first open)
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
            activity: ActivityClock::default(),
            cancel: None,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a socket is parked between turns
    #[must_use]
    pub fn has_kept_connection(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn url_for(&self, request: &StreamRequest) -> String {
        self.config
            .websocket_url
            .clone()
            .unwrap_or_else(|| websocket_url_for(&request.endpoint))
    }

    async fn connect(&self, url: &str) -> Result<WsStream, TransportError> {
        let mut ws_request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidState(format!("header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidState(format!("header value: {e}")))?;
            ws_request.headers_mut().insert(name, value);
        }

        match tokio::time::timeout(self.config.connect_timeout(), connect_async(ws_request)).await
        {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(WsError::Http(response))) => Err(TransportError::HttpStatus {
                status: response.status().as_u16(),
                body: response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default(),
                retry_after: None,
            }),
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(e.to_string())),
            Err(_) => Err(TransportError::ConnectionFailed(format!(
                "connect timed out after {}ms",
                self.config.connect_timeout_ms
            ))),
        }
    }

    /// Reuse the parked socket for `url`, or dial a new one
    async fn acquire(&self, url: &str) -> Result<(WsStream, bool), TransportError> {
        let parked = self.slot.lock().take();
        match parked {
            Some(conn) if conn.url == url => Ok((conn.stream, true)),
            _ => Ok((self.connect(url).await?, false)),
        }
    }
}

/// Payload text from a WebSocket message, if it carries one
fn payload_text(message: WsMessage) -> Option<Result<String, StreamError>> {
    match message {
        WsMessage::Text(text) => Some(Ok(text)),
        WsMessage::Binary(bytes) => Some(
            String::from_utf8(bytes)
                .map_err(|e| StreamError::Protocol(format!("Binary frame is not UTF-8: {e}"))),
        ),
        _ => None,
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
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

        let url = self.url_for(request);
        let body = request.body().to_string();

        let (mut stream, reused) = match self.acquire(&url).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.state.set(TransportState::Failed);
                return Err(e);
            }
        };
        tracing::debug!(url = %url, reused, "Opening WebSocket stream");

        if let Err(e) = stream.send(WsMessage::Text(body.clone())).await {
            if !reused {
                self.state.set(TransportState::Failed);
                return Err(TransportError::SendFailed(e.to_string()));
            }
            // Parked socket went away; dial once more
            tracing::debug!(error = %e, "Kept-open socket is dead, reconnecting");
            stream = match self.connect(&url).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.state.set(TransportState::Failed);
                    return Err(e);
                }
            };
            if let Err(e) = stream.send(WsMessage::Text(body)).await {
                self.state.set(TransportState::Failed);
                return Err(TransportError::SendFailed(e.to_string()));
            }
        }

        self.state.set(TransportState::Open);
        self.activity.touch();

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let state = self.state.clone();
        let activity = self.activity.clone();
        let slot = self.slot.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    next = stream.next() => next,
                };

                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket read failed");
                        state.set(TransportState::Failed);
                        let err = StreamError::Transport(TransportError::ReceiveFailed(e.to_string()));
                        let _ = deliver(&tx, &cancel, Err(err)).await;
                        return;
                    }
                    None => {
                        state.set(TransportState::Failed);
                        let _ =
                            deliver(&tx, &cancel, Err(TransportError::ConnectionClosed.into())).await;
                        return;
                    }
                };
                activity.touch();

                if let WsMessage::Close(frame) = message {
                    tracing::debug!(?frame, "WebSocket closed by peer");
                    state.set(TransportState::Failed);
                    let _ = deliver(&tx, &cancel, Err(TransportError::ConnectionClosed.into())).await;
                    return;
                }

                let text = match payload_text(message) {
                    Some(Ok(text)) => text,
                    Some(Err(e)) => {
                        state.set(TransportState::Failed);
                        let _ = deliver(&tx, &cancel, Err(e)).await;
                        return;
                    }
                    None => continue,
                };

                let trimmed = text.trim();
                let data = trimmed
                    .strip_prefix("data:")
                    .map_or(trimmed, str::trim_start);
                if data.is_empty() {
                    continue;
                }

                let chunks = if data == DONE_SENTINEL {
                    vec![Chunk::Done]
                } else {
                    match decode_payload(data) {
                        Ok(chunks) => chunks,
                        Err(e) => {
                            state.set(TransportState::Failed);
                            let _ = deliver(&tx, &cancel, Err(e)).await;
                            return;
                        }
                    }
                };

                for chunk in chunks {
                    let clean_end = chunk == Chunk::Done;
                    let terminal = chunk.is_terminal();
                    if !deliver(&tx, &cancel, Ok(TransportEvent::new(chunk))).await {
                        return;
                    }
                    if terminal {
                        if clean_end && !cancel.is_cancelled() {
                            *slot.lock() = Some(Connection { url, stream });
                        }
                        state.set(TransportState::Closed);
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            tracing::debug!("WebSocket stream closed");
        }
        if self.state.get().is_active() {
            self.state.set(TransportState::Closed);
        }
    }

    async fn health_check(&mut self) -> bool {
        if self.state().is_active() {
            return true;
        }
        let parked = self.slot.lock().take();
        let Some(mut conn) = parked else {
            return self.state() != TransportState::Failed;
        };

        if conn.stream.send(WsMessage::Ping(b"aistream".to_vec())).await.is_err() {
            tracing::debug!(url = %conn.url, "Ping failed");
            return false;
        }

        let pong = tokio::time::timeout(self.config.connect_timeout(), async {
            while let Some(message) = conn.stream.next().await {
                match message {
                    Ok(WsMessage::Pong(_)) => return true,
                    Ok(WsMessage::Close(_)) | Err(_) => return false,
                    Ok(_) => {}
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if pong {
            self.activity.touch();
            *self.slot.lock() = Some(conn);
        } else {
            tracing::debug!(url = %conn.url, "No pong from kept-open socket");
        }
        pong
    }

    fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    fn recycle(&mut self) {
        self.close();
        self.slot.lock().take();
        self.state.set(TransportState::Idle);
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Accepts one socket and answers every text request with `replies`
    async fn serve(replies: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() {
                    for reply in &replies {
                        ws.send(WsMessage::Text((*reply).to_string())).await.unwrap();
                    }
                }
            }
        });
        format!("http://{addr}/chat")
    }

    async fn drain(mut rx: mpsc::Receiver<TransportResult>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(item) = rx.recv().await {
            chunks.push(item.unwrap().chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_stream_and_keep_open() {
        let endpoint = serve(vec![r#"{"token":"Hi"}"#, "data: [DONE]"]).await;
        let mut transport = WebSocketTransport::new(TransportConfig::with_kind(
            TransportKind::WebSocket,
        ));
        let request = StreamRequest::new(endpoint, vec![]);

        let rx = transport.open(&request).await.unwrap();
        assert_eq!(drain(rx).await, vec![Chunk::Token("Hi".into()), Chunk::Done]);
        assert!(transport.has_kept_connection());

        // Same socket serves the second turn
        let rx = transport.open(&request).await.unwrap();
        assert_eq!(drain(rx).await, vec![Chunk::Token("Hi".into()), Chunk::Done]);
        assert!(transport.health_check().await);
    }

    #[tokio::test]
    async fn test_recycle_drops_connection() {
        let endpoint = serve(vec!["[DONE]"]).await;
        let mut transport = WebSocketTransport::new(TransportConfig::default());
        let rx = transport
            .open(&StreamRequest::new(endpoint, vec![]))
            .await
            .unwrap();
        assert_eq!(drain(rx).await, vec![Chunk::Done]);

        transport.recycle();
        assert!(!transport.has_kept_connection());
        assert_eq!(transport.state(), TransportState::Idle);
    }
}
