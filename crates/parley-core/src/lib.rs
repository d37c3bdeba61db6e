pub mod endpoint;
pub mod errors;
pub mod ids;
pub mod log;
pub mod message;
pub mod protocol;
pub mod security;

pub use endpoint::Endpoint;
pub use errors::{CommandError, ConnectionError, DisconnectReason, ProtocolError, TransportError};
pub use ids::{ConversationId, MessageId, UserId};
pub use log::{Inserted, MessageLog};
pub use message::{Message, Sender};
pub use protocol::{decode_server_frame, ClientFrame, ServerFrame};
pub use security::Credential;
