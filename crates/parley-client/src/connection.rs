//! Transport lifecycle for one conversation.
//!
//! `ConnectionManager` owns at most one background connection task. The task
//! dials through a [`Connector`], pumps frames in both directions and reports
//! everything that happens as [`ConnectionEvent`]s on a per-connection channel.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use parley_core::{
    decode_server_frame, ClientFrame, ConnectionError, Credential, Endpoint, ProtocolError, ServerFrame,
    TransportError,
};
use parley_settings::ConnectionSettings;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use url::Url;

use crate::reconnect::ReconnectPolicy;
use crate::transport::{Connector, Link};

/// Lifecycle state of the transport.
///
/// `Disconnected → Connecting → Connected → Disconnected`, re-entering
/// `Connecting` only under the reconnect policy. `Closing` always resolves
/// to `Disconnected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Closing => f.write_str("closing"),
        }
    }
}

/// Everything the connection task reports, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    /// The handshake failed.
    ConnectionError(TransportError),
    /// An established connection ended. `None` on a clean server close.
    Disconnected { error: Option<TransportError> },
    /// A retry is scheduled after `delay`. `attempt` starts at 1.
    Reconnecting { attempt: u32, delay: Duration },
    Frame(ServerFrame),
    ProtocolViolation(ProtocolError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    /// Upper bound on the transport handshake.
    pub connect_timeout: Duration,
    /// How long `close()` waits for the task before aborting it.
    pub close_timeout: Duration,
    pub token_param: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default())
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            close_timeout: settings.close_timeout(),
            token_param: settings.token_param.clone(),
            reconnect: ReconnectPolicy::from(&settings.reconnect),
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        Self {
            connector,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events: None,
            outbound: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Validate `endpoint` and start connecting.
    ///
    /// Returns as soon as the connection task is running; the outcome arrives
    /// as a `Connected` or `ConnectionError` event. Any existing connection is
    /// torn down first.
    pub async fn open(&mut self, endpoint: &str, credential: &Credential) -> Result<(), ConnectionError> {
        let endpoint = Endpoint::parse(endpoint)?;
        self.open_endpoint(&endpoint, credential).await;
        Ok(())
    }

    /// Same as [`open`](Self::open) for an already-validated endpoint.
    pub async fn open_endpoint(&mut self, endpoint: &Endpoint, credential: &Credential) {
        if self.task.is_some() {
            debug!("replacing existing connection");
            self.close().await;
        }

        let url = endpoint.connect_url(credential, &self.config.token_param);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        *self.state.write() = ConnectionState::Connecting;
        info!(endpoint = %endpoint, connector = self.connector.name(), "opening connection");

        let driver = Driver {
            connector: Arc::clone(&self.connector),
            url,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            events: event_tx,
            outbound: outbound_rx,
            cancel: cancel.clone(),
        };

        self.events = Some(event_rx);
        self.outbound = Some(outbound_tx);
        self.cancel = cancel;
        let span = info_span!("connection", connector = self.connector.name(), host = endpoint.host());
        self.task = Some(tokio::spawn(driver.run().instrument(span)));
    }

    /// Queue a frame for the connection task. Only valid while `Connected`.
    pub fn send(&self, frame: ClientFrame) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        outbound.send(frame).map_err(|_| ConnectionError::NotConnected)
    }

    /// Next event of the current connection. `None` once the connection task
    /// has finished and its events are drained, or when nothing is open.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.events.as_mut()?.recv().await
    }

    /// Tear down the connection. Idempotent; always ends `Disconnected`.
    ///
    /// Pending events of the old connection are discarded.
    pub async fn close(&mut self) {
        let task = self.task.take();
        self.outbound = None;

        if task.is_none() && self.state() == ConnectionState::Disconnected {
            self.events = None;
            return;
        }

        {
            // Cancel under the lock so the task cannot publish a newer state.
            let mut state = self.state.write();
            *state = ConnectionState::Closing;
            self.cancel.cancel();
        }

        if let Some(mut task) = task {
            if tokio::time::timeout(self.config.close_timeout, &mut task).await.is_err() {
                warn!(
                    timeout_ms = self.config.close_timeout.as_millis() as u64,
                    "connection task did not stop in time, aborting"
                );
                task.abort();
            }
        }

        *self.state.write() = ConnectionState::Disconnected;
        self.events = None;
        debug!("connection closed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum PumpExit {
    /// Close requested, or nobody is listening any more.
    Cancelled,
    Lost(Option<TransportError>),
}

/// State owned by the background connection task.
struct Driver {
    connector: Arc<dyn Connector>,
    url: Url,
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let mut attempt = 0u32;

        loop {
            let connect = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&self.url));
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = connect => result.unwrap_or_else(|_| {
                    Err(TransportError::Network(format!(
                        "handshake timed out after {}ms",
                        self.config.connect_timeout.as_millis()
                    )))
                }),
            };

            let error = match result {
                Ok(link) => {
                    if !self.transition(ConnectionState::Connected) {
                        return;
                    }
                    attempt = 0;
                    info!("connected");
                    self.emit(ConnectionEvent::Connected);

                    match self.pump(link).await {
                        PumpExit::Cancelled => return,
                        PumpExit::Lost(error) => {
                            if !self.transition(ConnectionState::Disconnected) {
                                return;
                            }
                            match &error {
                                Some(e) => warn!(reason = %e.reason(), error = %e, "connection lost"),
                                None => info!("server closed the connection"),
                            }
                            self.emit(ConnectionEvent::Disconnected { error: error.clone() });
                            match error {
                                Some(e) => e,
                                None => return,
                            }
                        }
                    }
                }
                Err(error) => {
                    if !self.transition(ConnectionState::Disconnected) {
                        return;
                    }
                    warn!(reason = %error.reason(), error = %error, "connection failed");
                    self.emit(ConnectionEvent::ConnectionError(error.clone()));
                    error
                }
            };

            if !error.is_retryable() {
                return;
            }
            let Some(delay) = self.config.reconnect.next_delay(attempt) else {
                if self.config.reconnect.enabled {
                    warn!(attempts = attempt, "giving up reconnecting");
                }
                return;
            };
            attempt += 1;

            // Frames queued for the dead connection are not replayed.
            while self.outbound.try_recv().is_ok() {}

            if !self.transition(ConnectionState::Connecting) {
                return;
            }
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(&mut self, link: Link) -> PumpExit {
        let Link { mut sink, mut stream } = link;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    // Frames queued before the close still go out, ahead of the close frame.
                    let outbound = &mut self.outbound;
                    let flush = async {
                        while let Ok(frame) = outbound.try_recv() {
                            sink.send(frame.encode()).await?;
                        }
                        sink.close().await
                    };
                    match tokio::time::timeout(self.config.close_timeout, flush).await {
                        Ok(Ok(())) => debug!("sent close frame"),
                        Ok(Err(e)) => debug!(error = %e, "close frame failed"),
                        Err(_) => debug!("close frame timed out"),
                    }
                    return PumpExit::Cancelled;
                }

                Some(frame) = self.outbound.recv() => {
                    let action = frame.action();
                    if let Err(e) = sink.send(frame.encode()).await {
                        return PumpExit::Lost(Some(e));
                    }
                    trace!(action, "frame sent");
                }

                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => {
                        let event = match decode_server_frame(&text) {
                            Ok(frame) => {
                                trace!(frame_type = frame.frame_type(), "frame received");
                                ConnectionEvent::Frame(frame)
                            }
                            Err(e) => {
                                warn!(kind = e.error_kind(), error = %e, "protocol violation");
                                ConnectionEvent::ProtocolViolation(e)
                            }
                        };
                        if self.events.send(event).is_err() {
                            return PumpExit::Cancelled;
                        }
                    }
                    Some(Err(e)) => return PumpExit::Lost(Some(e)),
                    None => return PumpExit::Lost(None),
                },
            }
        }
    }

    /// Publish a new state unless a close has already been requested.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.write();
        if self.cancel.is_cancelled() {
            return false;
        }
        let from = *state;
        trace!(%from, to = %next, "state transition");
        *state = next;
        true
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockOutcome};
    use chrono::{TimeZone, Utc};
    use parley_core::{Message, MessageId, Sender};

    const ENDPOINT: &str = "ws://chat.test/ws/chat/1/";

    fn manager(connector: &MockConnector) -> ConnectionManager {
        manager_with(connector, ConnectionConfig::default())
    }

    fn manager_with(connector: &MockConnector, config: ConnectionConfig) -> ConnectionManager {
        ConnectionManager::new(Arc::new(connector.clone()), config)
    }

    fn retrying() -> ConnectionConfig {
        ConnectionConfig {
            reconnect: ReconnectPolicy::backoff(3, Duration::from_millis(100), Duration::from_secs(1)),
            ..ConnectionConfig::default()
        }
    }

    fn token() -> Credential {
        Credential::new("tok")
    }

    fn message(id: &str) -> Message {
        Message::new(
            id,
            "hello",
            Sender::new("u2", "Grace"),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_endpoint_fails_without_dialing() {
        let connector = MockConnector::new();
        let mut conn = manager(&connector);

        for bad in ["", "http://chat.test/ws", "ws://user:pw@chat.test/ws", "nonsense"] {
            let err = conn.open(bad, &token()).await.unwrap_err();
            assert!(matches!(err, ConnectionError::InvalidEndpoint(_)), "{bad}");
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(connector.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_connects_and_delivers_frames() {
        let connector = MockConnector::new();
        let peer = connector.push_link();
        let mut conn = manager(&connector);

        conn.open(ENDPOINT, &token()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        assert_eq!(conn.recv().await, Some(ConnectionEvent::Connected));
        assert_eq!(conn.state(), ConnectionState::Connected);

        let frame = ServerFrame::NewMessage { message: message("m1") };
        peer.push(&frame);
        assert_eq!(conn.recv().await, Some(ConnectionEvent::Frame(frame)));
    }

    #[tokio::test(start_paused = true)]
    async fn credential_is_sent_as_query_parameter() {
        let connector = MockConnector::new();
        let _peer = connector.push_link();
        let mut conn = manager_with(
            &connector,
            ConnectionConfig {
                token_param: "access_token".into(),
                ..ConnectionConfig::default()
            },
        );

        conn.open(ENDPOINT, &token()).await.unwrap();
        let _ = conn.recv().await;
        let dialed = connector.dialed();
        assert_eq!(dialed.len(), 1);
        assert_eq!(dialed[0].query(), Some("access_token=tok"));
        assert_eq!(dialed[0].path(), "/ws/chat/1/");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_handshake_reports_reason() {
        let connector = MockConnector::new();
        connector.push_failure(TransportError::AuthRejected("401".into()));
        let mut conn = manager(&connector);

        conn.open(ENDPOINT, &token()).await.unwrap();
        match conn.recv().await {
            Some(ConnectionEvent::ConnectionError(err)) => {
                assert_eq!(err.reason(), parley_core::DisconnectReason::AuthRejected)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_connected() {
        let connector = MockConnector::new();
        let mut peer = connector.push_link();
        let mut conn = manager(&connector);

        let frame = ClientFrame::Typing { is_typing: true };
        assert_eq!(conn.send(frame.clone()), Err(ConnectionError::NotConnected));

        conn.open(ENDPOINT, &token()).await.unwrap();
        assert_eq!(conn.send(frame.clone()), Err(ConnectionError::NotConnected));

        let _ = conn.recv().await;
        conn.send(frame.clone()).unwrap();
        assert_eq!(peer.recv().await, Some(frame));
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_connecting_never_connects() {
        let connector = MockConnector::new();
        connector.push(MockOutcome::delayed(
            Duration::from_secs(5),
            MockOutcome::Connect(crate::mock::link_pair().0),
        ));
        let mut conn = manager(&connector);

        conn.open(ENDPOINT, &token()).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_closes_the_link() {
        let connector = MockConnector::new();
        let mut peer = connector.push_link();
        let mut conn = manager(&connector);

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.open(ENDPOINT, &token()).await.unwrap();
        let _ = conn.recv().await;
        conn.close().await;
        conn.close().await;

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(peer.recv().await, None);
        assert!(conn.send(ClientFrame::Typing { is_typing: false }).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_tears_down_previous_connection() {
        let connector = MockConnector::new();
        let mut first = connector.push_link();
        let second = connector.push_link();
        let mut conn = manager(&connector);

        conn.open(ENDPOINT, &token()).await.unwrap();
        assert_eq!(conn.recv().await, Some(ConnectionEvent::Connected));
        first.push(&ServerFrame::Error { message: "stale".into() });

        conn.open(ENDPOINT, &token()).await.unwrap();
        assert_eq!(first.recv().await, None);

        // Nothing from the first connection leaks into the new channel.
        assert_eq!(conn.recv().await, Some(ConnectionEvent::Connected));
        second.push(&ServerFrame::Error { message: "fresh".into() });
        assert_eq!(
            conn.recv().await,
            Some(ConnectionEvent::Frame(ServerFrame::Error { message: "fresh".into() }))
        );
        assert_eq!(connector.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_non_fatal() {
        let connector = MockConnector::new();
        let peer = connector.push_link();
        let mut conn = manager(&connector);
        conn.open(ENDPOINT, &token()).await.unwrap();
        let _ = conn.recv().await;

        peer.push_raw(r#"{"type":"presence"}"#);
        peer.push_raw("{{{");
        peer.push(&ServerFrame::Error { message: "ok".into() });

        assert_eq!(
            conn.recv().await,
            Some(ConnectionEvent::ProtocolViolation(ProtocolError::UnknownTag("presence".into())))
        );
        assert!(matches!(
            conn.recv().await,
            Some(ConnectionEvent::ProtocolViolation(ProtocolError::Malformed(_)))
        ));
        assert!(matches!(conn.recv().await, Some(ConnectionEvent::Frame(_))));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_ends_without_retry() {
        let connector = MockConnector::new();
        let mut peer = connector.push_link();
        let mut conn = manager_with(&connector, retrying());
        conn.open(ENDPOINT, &token()).await.unwrap();
        let _ = conn.recv().await;

        peer.hang_up();
        assert_eq!(conn.recv().await, Some(ConnectionEvent::Disconnected { error: None }));
        assert_eq!(conn.recv().await, None);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(connector.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_is_retried_with_backoff() {
        let connector = MockConnector::new();
        let first = connector.push_link();
        let second = connector.push_link();
        let mut conn = manager_with(&connector, retrying());
        conn.open(ENDPOINT, &token()).await.unwrap();
        assert_eq!(conn.recv().await, Some(ConnectionEvent::Connected));

        let lost = TransportError::Network("reset".into());
        first.fail(lost.clone());
        assert_eq!(conn.recv().await, Some(ConnectionEvent::Disconnected { error: Some(lost) }));
        match conn.recv().await {
            Some(ConnectionEvent::Reconnecting { attempt, delay }) => {
                assert_eq!(attempt, 1);
                assert!(delay >= Duration::from_millis(50));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.recv().await, Some(ConnectionEvent::Connected));

        second.push(&ServerFrame::ChatHistory { messages: vec![message("m1")] });
        assert!(matches!(conn.recv().await, Some(ConnectionEvent::Frame(ServerFrame::ChatHistory { .. }))));
        assert_eq!(connector.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_is_never_retried() {
        let connector = MockConnector::new();
        connector.push_failure(TransportError::AuthRejected("403".into()));
        let _spare = connector.push_link();
        let mut conn = manager_with(&connector, retrying());

        conn.open(ENDPOINT, &token()).await.unwrap();
        assert!(matches!(conn.recv().await, Some(ConnectionEvent::ConnectionError(_))));
        assert_eq!(conn.recv().await, None);
        assert_eq!(connector.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_max_attempts() {
        let connector = MockConnector::new();
        for _ in 0..4 {
            connector.push_failure(TransportError::Network("refused".into()));
        }
        let mut conn = manager_with(&connector, retrying());
        conn.open(ENDPOINT, &token()).await.unwrap();

        let mut failures = 0;
        let mut retries = 0;
        while let Some(event) = conn.recv().await {
            match event {
                ConnectionEvent::ConnectionError(_) => failures += 1,
                ConnectionEvent::Reconnecting { .. } => retries += 1,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(failures, 4);
        assert_eq!(retries, 3);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handshake_times_out_as_network() {
        let connector = MockConnector::new();
        connector.push_hang();
        let mut conn = manager_with(
            &connector,
            ConnectionConfig {
                connect_timeout: Duration::from_secs(3),
                ..ConnectionConfig::default()
            },
        );

        conn.open(ENDPOINT, &token()).await.unwrap();
        match conn.recv().await {
            Some(ConnectionEvent::ConnectionError(err)) => {
                assert!(err.is_retryable());
                assert!(err.to_string().contains("timed out"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_mark_read_reaches_peer() {
        let connector = MockConnector::new();
        let mut peer = connector.push_link();
        let mut conn = manager(&connector);
        conn.open(ENDPOINT, &token()).await.unwrap();
        let _ = conn.recv().await;

        let frame = ClientFrame::MarkRead {
            message_id: MessageId::from_raw("m7"),
        };
        conn.send(frame.clone()).unwrap();
        assert_eq!(peer.recv().await, Some(frame));
    }
}
