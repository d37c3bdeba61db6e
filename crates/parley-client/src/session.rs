//! Client side of one conversation: ordered log, read state, typing presence.
//!
//! All state lives on the caller's task. [`ConversationSession::next_event`]
//! is the single place where connection events and timers are applied; the
//! command methods never wait on the network.

use std::sync::Arc;
use std::time::Duration;

use parley_core::{
    ClientFrame, CommandError, ConversationId, Credential, Inserted, Message, MessageId, MessageLog, ServerFrame,
    TransportError, UserId,
};
use parley_settings::ParleySettings;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use crate::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState};
use crate::debouncer::{TypingDebouncer, TypingSignal};
use crate::presence::PeerPresence;
use crate::transport::Connector;

#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub idle_timeout: Duration,
    pub peer_expiry: Duration,
    /// `0` never drops the connection.
    pub max_consecutive_violations: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&ParleySettings::default())
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &ParleySettings) -> Self {
        Self {
            connection: ConnectionConfig::from_settings(&settings.connection),
            idle_timeout: settings.typing.idle_timeout(),
            peer_expiry: settings.typing.peer_expiry(),
            max_consecutive_violations: settings.protocol.max_consecutive_violations,
        }
    }
}

/// What changed in one step of the session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Connected,
    /// An established connection ended. `None` on a clean server close.
    Disconnected { error: Option<TransportError> },
    ConnectionFailed(TransportError),
    Reconnecting { attempt: u32, delay: Duration },
    /// The log was replaced by a `chat_history` frame.
    HistoryReplaced { count: usize },
    /// A new message entered the log. `reordered` is set when it landed
    /// before the previous tail.
    MessageReceived { message: Message, reordered: bool },
    PeerTyping(bool),
    /// A protocol violation; the connection stays up unless the consecutive
    /// limit was reached.
    Warning(String),
    /// A server-side `error` frame.
    ServerNotice(String),
}

/// Read-only view of the session, republished on every change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub messages: Vec<Message>,
    pub peer_typing: bool,
}

enum Wake {
    Connection(ConnectionEvent),
    TypingIdle,
    PresenceExpired,
}

pub struct ConversationSession {
    conversation: Option<ConversationId>,
    local_user: UserId,
    connection: ConnectionManager,
    log: MessageLog,
    debouncer: TypingDebouncer,
    presence: PeerPresence,
    max_violations: u32,
    violations: u32,
    snapshot: watch::Sender<SessionSnapshot>,
    closed: bool,
}

impl ConversationSession {
    pub fn new(connector: Arc<dyn Connector>, local_user: UserId, config: SessionConfig) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        Self {
            conversation: None,
            local_user,
            connection: ConnectionManager::new(connector, config.connection),
            log: MessageLog::new(),
            debouncer: TypingDebouncer::new(config.idle_timeout),
            presence: PeerPresence::new(config.peer_expiry),
            max_violations: config.max_consecutive_violations,
            violations: 0,
            snapshot,
            closed: false,
        }
    }

    /// Tag log output with the conversation this session belongs to.
    pub fn with_conversation(mut self, conversation: ConversationId) -> Self {
        self.conversation = Some(conversation);
        self
    }

    // ── Commands ────────────────────────────────────────────────────────

    /// Start connecting. Returns once the attempt is under way; watch
    /// [`next_event`](Self::next_event) for the outcome.
    #[instrument(skip_all, fields(conversation_id = ?self.conversation))]
    pub async fn open(&mut self, endpoint: &str, credential: &Credential) -> Result<(), CommandError> {
        self.ensure_open()?;
        self.connection.open(endpoint, credential).await?;

        self.debouncer.reset();
        let _ = self.presence.clear();
        self.violations = 0;
        self.publish();
        Ok(())
    }

    /// Send a chat message. The message shows up in the log only once the
    /// server echoes it back as `new_message`.
    pub fn send_message(&mut self, text: &str) -> Result<(), CommandError> {
        self.ensure_open()?;
        if text.trim().is_empty() {
            return Err(CommandError::EmptyMessage);
        }
        if self.connection.state() != ConnectionState::Connected {
            return Err(CommandError::NotConnected);
        }

        self.connection.send(ClientFrame::SendMessage {
            content: text.to_owned(),
        })?;
        debug!(conversation_id = ?self.conversation, len = text.len(), "message sent");

        if let Some(signal) = self.debouncer.set_editing(false, Instant::now()) {
            self.send_typing(signal);
        }
        Ok(())
    }

    /// Report local editing activity. Typing frames go out only while
    /// connected; otherwise the debouncer state still advances and a burst
    /// still in progress is announced once the connection comes up.
    pub fn set_editing(&mut self, editing: bool) -> Result<(), CommandError> {
        self.ensure_open()?;
        if let Some(signal) = self.debouncer.set_editing(editing, Instant::now()) {
            self.send_typing(signal);
        }
        Ok(())
    }

    /// Send a read receipt and flip the local flag.
    ///
    /// Unknown and already-read ids are a no-op returning `Ok(false)`.
    pub fn mark_read(&mut self, message_id: &MessageId) -> Result<bool, CommandError> {
        self.ensure_open()?;
        match self.log.get(message_id) {
            None => {
                debug!(%message_id, "mark_read for unknown message ignored");
                return Ok(false);
            }
            Some(message) if message.is_read => return Ok(false),
            Some(_) => {}
        }
        if self.connection.state() != ConnectionState::Connected {
            return Err(CommandError::NotConnected);
        }

        self.connection.send(ClientFrame::MarkRead {
            message_id: message_id.clone(),
        })?;
        let changed = self.log.mark_read(message_id).unwrap_or(false);
        if changed {
            self.publish();
        }
        Ok(changed)
    }

    /// Stop typing, close the connection and refuse further commands.
    /// Idempotent.
    #[instrument(skip_all, fields(conversation_id = ?self.conversation))]
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(signal) = self.debouncer.set_editing(false, Instant::now()) {
            self.send_typing(signal);
        }
        self.connection.close().await;
        let _ = self.presence.clear();
        self.closed = true;
        self.publish();
        info!("session closed");
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn messages(&self) -> &[Message] {
        self.log.as_slice()
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.log.get(id)
    }

    pub fn unread_count(&self) -> usize {
        self.log.unread_count()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_peer_typing(&self) -> bool {
        self.presence.is_typing()
    }

    pub fn is_local_typing(&self) -> bool {
        self.debouncer.is_typing()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_state: self.connection.state(),
            messages: self.log.as_slice().to_vec(),
            peer_typing: self.presence.is_typing(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    // ── Event pump ──────────────────────────────────────────────────────

    /// Wait for the next connection event or timer and apply it.
    ///
    /// Returns `None` once the session is closed, or when no connection is
    /// active and no timer is pending.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if self.closed {
                return None;
            }

            let typing_deadline = self.debouncer.deadline();
            let presence_deadline = self.presence.deadline();

            let wake = tokio::select! {
                Some(event) = self.connection.recv() => Wake::Connection(event),
                _ = sleep_until(typing_deadline.unwrap_or_else(Instant::now)), if typing_deadline.is_some() => {
                    Wake::TypingIdle
                }
                _ = sleep_until(presence_deadline.unwrap_or_else(Instant::now)), if presence_deadline.is_some() => {
                    Wake::PresenceExpired
                }
                else => return None,
            };

            let event = match wake {
                Wake::Connection(event) => self.on_connection_event(event).await,
                Wake::TypingIdle => {
                    if let Some(signal) = self.debouncer.poll_expired(Instant::now()) {
                        self.send_typing(signal);
                    }
                    None
                }
                Wake::PresenceExpired => {
                    if self.presence.poll_expired(Instant::now()) {
                        debug!("peer typing expired");
                        self.publish();
                        Some(SessionEvent::PeerTyping(false))
                    } else {
                        None
                    }
                }
            };

            if event.is_some() {
                return event;
            }
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) -> Option<SessionEvent> {
        match event {
            ConnectionEvent::Connected => {
                self.violations = 0;
                if self.debouncer.is_typing() {
                    self.send_typing(TypingSignal::Start);
                }
                self.publish();
                Some(SessionEvent::Connected)
            }
            ConnectionEvent::ConnectionError(error) => {
                self.publish();
                Some(SessionEvent::ConnectionFailed(error))
            }
            ConnectionEvent::Disconnected { error } => {
                self.debouncer.reset();
                let _ = self.presence.clear();
                self.publish();
                Some(SessionEvent::Disconnected { error })
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                self.publish();
                Some(SessionEvent::Reconnecting { attempt, delay })
            }
            ConnectionEvent::Frame(frame) => {
                self.violations = 0;
                self.apply_frame(frame)
            }
            ConnectionEvent::ProtocolViolation(error) => {
                self.violations += 1;
                if self.max_violations > 0 && self.violations >= self.max_violations {
                    warn!(
                        conversation_id = ?self.conversation,
                        violations = self.violations,
                        "too many consecutive protocol violations, dropping connection"
                    );
                    let count = std::mem::take(&mut self.violations);
                    self.connection.close().await;
                    self.debouncer.reset();
                    let _ = self.presence.clear();
                    self.publish();
                    return Some(SessionEvent::Warning(format!(
                        "closed connection after {count} consecutive protocol violations (last: {error})"
                    )));
                }
                Some(SessionEvent::Warning(error.to_string()))
            }
        }
    }

    fn apply_frame(&mut self, frame: ServerFrame) -> Option<SessionEvent> {
        match frame {
            ServerFrame::ChatHistory { messages } => {
                self.log.replace_all(messages);
                let count = self.log.len();
                debug!(conversation_id = ?self.conversation, count, "history replaced");
                self.publish();
                Some(SessionEvent::HistoryReplaced { count })
            }
            ServerFrame::NewMessage { message } => {
                let received = message.clone();
                match self.log.insert(message) {
                    Inserted::Duplicate => {
                        debug!(message_id = %received.id, "duplicate message ignored");
                        None
                    }
                    placement => {
                        self.publish();
                        Some(SessionEvent::MessageReceived {
                            message: received,
                            reordered: matches!(placement, Inserted::Reordered { .. }),
                        })
                    }
                }
            }
            ServerFrame::Typing { user_id, is_typing } => {
                if user_id == self.local_user {
                    return None;
                }
                if self.presence.apply(is_typing, Instant::now()) {
                    self.publish();
                    Some(SessionEvent::PeerTyping(is_typing))
                } else {
                    None
                }
            }
            ServerFrame::Error { message } => {
                info!(conversation_id = ?self.conversation, %message, "server notice");
                Some(SessionEvent::ServerNotice(message))
            }
        }
    }

    fn send_typing(&self, signal: TypingSignal) {
        if self.connection.state() != ConnectionState::Connected {
            debug!(?signal, "not connected, typing signal dropped");
            return;
        }
        if let Err(e) = self.connection.send(signal.frame()) {
            debug!(?signal, error = %e, "typing signal dropped");
        }
    }

    fn ensure_open(&self) -> Result<(), CommandError> {
        if self.closed {
            Err(CommandError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn publish(&self) {
        let _ = self.snapshot.send_replace(self.snapshot());
    }
}
