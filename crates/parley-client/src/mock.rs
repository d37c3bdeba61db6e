use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_core::{ClientFrame, ServerFrame, TransportError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::PollSender;
use url::Url;

use crate::transport::{Connector, Link};

/// Pre-programmed connection outcomes for deterministic tests without a network.
pub enum MockOutcome {
    /// Handshake succeeds; the test drives the server side through the peer.
    Connect(MockLink),
    /// Handshake fails with this error.
    Fail(TransportError),
    /// Handshake never completes.
    Hang,
    /// Wait a duration, then apply the inner outcome.
    Delay(Duration, Box<MockOutcome>),
}

impl MockOutcome {
    pub fn delayed(delay: Duration, inner: MockOutcome) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Client-side halves of a scripted connection, handed out by `connect()`.
pub struct MockLink {
    to_client: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    from_client: mpsc::Sender<String>,
}

/// Server side of a scripted connection.
pub struct MockPeer {
    to_client: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
    from_client: mpsc::Receiver<String>,
}

/// Create a connected link/peer pair.
pub fn link_pair() -> (MockLink, MockPeer) {
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (from_client_tx, from_client_rx) = mpsc::channel(64);
    (
        MockLink {
            to_client: to_client_rx,
            from_client: from_client_tx,
        },
        MockPeer {
            to_client: Some(to_client_tx),
            from_client: from_client_rx,
        },
    )
}

impl MockPeer {
    /// Push an encoded server frame to the client.
    pub fn push(&self, frame: &ServerFrame) {
        let text = serde_json::to_string(frame).unwrap_or_default();
        self.push_raw(text);
    }

    /// Push arbitrary text, e.g. a malformed frame.
    pub fn push_raw(&self, text: impl Into<String>) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(text.into()));
        }
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, error: TransportError) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Err(error));
        }
    }

    /// Close the server side cleanly; the client sees end-of-stream.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    /// Next frame the client sent, decoded.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        let text = self.from_client.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// A frame already sent by the client, without waiting.
    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        let text = self.from_client.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Drain every frame sent so far.
    pub fn drain(&mut self) -> Vec<ClientFrame> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Connector that replays scripted outcomes in order.
#[derive(Clone, Default)]
pub struct MockConnector {
    outcomes: Arc<Mutex<VecDeque<MockOutcome>>>,
    dialed: Arc<Mutex<Vec<Url>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Script a successful connection and return its server side.
    pub fn push_link(&self) -> MockPeer {
        let (link, peer) = link_pair();
        self.push(MockOutcome::Connect(link));
        peer
    }

    pub fn push_failure(&self, error: TransportError) {
        self.push(MockOutcome::Fail(error));
    }

    pub fn push_hang(&self) {
        self.push(MockOutcome::Hang);
    }

    /// Number of connection attempts made so far.
    pub fn call_count(&self) -> usize {
        self.dialed.lock().len()
    }

    /// URLs dialed, in order.
    pub fn dialed(&self) -> Vec<Url> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, url: &Url) -> Result<Link, TransportError> {
        self.dialed.lock().push(url.clone());
        let outcome = self.outcomes.lock().pop_front();

        let mut outcome = match outcome {
            Some(o) => o,
            None => return Err(TransportError::Network("no scripted connection".into())),
        };

        loop {
            match outcome {
                MockOutcome::Connect(link) => {
                    let sink = PollSender::new(link.from_client)
                        .sink_map_err(|_| TransportError::Network("peer closed".into()));
                    let stream = UnboundedReceiverStream::new(link.to_client);
                    return Ok(Link::new(Box::pin(sink), Box::pin(stream)));
                }
                MockOutcome::Fail(error) => return Err(error),
                MockOutcome::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!("pending future resolved");
                }
                MockOutcome::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    outcome = *inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("ws://mock/ws").unwrap()
    }

    #[tokio::test]
    async fn scripted_link_carries_frames_both_ways() {
        let connector = MockConnector::new();
        let mut peer = connector.push_link();

        let mut link = connector.connect(&url()).await.ok().unwrap();
        peer.push(&ServerFrame::Error {
            message: "hi".into(),
        });
        let text = link.stream.next().await.unwrap().unwrap();
        assert!(text.contains("\"type\":\"error\""));

        link.sink
            .send(ClientFrame::Typing { is_typing: true }.encode())
            .await
            .unwrap();
        assert_eq!(peer.recv().await, Some(ClientFrame::Typing { is_typing: true }));
        assert_eq!(connector.call_count(), 1);
    }

    #[tokio::test]
    async fn failures_replay_in_order() {
        let connector = MockConnector::new();
        connector.push_failure(TransportError::AuthRejected("401".into()));

        let err = connector.connect(&url()).await.err().unwrap();
        assert!(matches!(err, TransportError::AuthRejected(_)));

        let err = connector.connect(&url()).await.err().unwrap();
        assert!(matches!(err, TransportError::Network(_)));
        assert_eq!(connector.call_count(), 2);
    }

    #[tokio::test]
    async fn hang_up_ends_stream() {
        let connector = MockConnector::new();
        let mut peer = connector.push_link();
        let mut link = connector.connect(&url()).await.ok().unwrap();
        peer.hang_up();
        assert!(link.stream.next().await.is_none());
    }
}
