//! Real-time conversation client: transport lifecycle, typing debounce and
//! the session state machine that ties them together.

#![deny(unsafe_code)]

pub mod connection;
pub mod debouncer;
pub mod presence;
pub mod reconnect;
pub mod session;
pub mod transport;

pub mod mock;

pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState};
pub use debouncer::{TypingDebouncer, TypingSignal};
pub use presence::PeerPresence;
pub use reconnect::ReconnectPolicy;
pub use session::{ConversationSession, SessionConfig, SessionEvent, SessionSnapshot};
pub use transport::{Connector, Link, WsConnector};
