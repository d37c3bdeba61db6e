use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use parley_core::TransportError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use url::Url;

/// Outbound half of an established connection: accepts encoded text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of an established connection: yields raw text frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An established bidirectional text-frame connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Dials a transport endpoint. Implemented for WebSockets and for tests.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, url: &Url) -> Result<Link, TransportError>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn connect(&self, url: &Url) -> Result<Link, TransportError> {
        let (ws, response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                TransportError::Network(format!("handshake timed out after {:?}", self.connect_timeout))
            })?
            .map_err(classify_ws_error)?;

        tracing::debug!(status = %response.status(), host = ?url.host_str(), "websocket handshake complete");

        let (ws_tx, ws_rx) = ws.split();

        let sink = ws_tx
            .sink_map_err(classify_ws_error)
            .with(|text: String| future::ready(Ok::<_, TransportError>(WsMessage::Text(text.into()))));

        let stream = ws_rx.filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!(len = bytes.len(), "dropping non-UTF-8 binary frame");
                        None
                    }
                },
                // tungstenite answers pings itself; a close frame ends the stream.
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => None,
                Ok(WsMessage::Close(frame)) => {
                    tracing::debug!(?frame, "server sent close frame");
                    None
                }
                Err(e) => Some(Err(classify_ws_error(e))),
            })
        });

        Ok(Link::new(Box::pin(sink), Box::pin(stream)))
    }
}

/// Map a tungstenite failure onto the transport error taxonomy.
pub fn classify_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            TransportError::from_status(status, body)
        }
        // Peer vanished mid-connection; treat like a dropped socket.
        tungstenite::Error::Protocol(tungstenite::error::ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::Network("connection reset without closing handshake".into())
        }
        tungstenite::Error::HttpFormat(e) => TransportError::ProtocolMismatch(e.to_string()),
        tungstenite::Error::Protocol(e) => TransportError::ProtocolMismatch(e.to_string()),
        tungstenite::Error::Url(e) => TransportError::ProtocolMismatch(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Network("connection closed".into())
        }
        other => TransportError::Network(other.to_string()),
    }
}
