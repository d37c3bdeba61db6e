//! Wire protocol: JSON text frames tagged by `type` (server → client) or
//! `action` (client → server).

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::ids::{MessageId, UserId};
use crate::message::Message;

/// Frames the server pushes to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Full log replacement. Sent on every (re)connect.
    #[serde(rename = "chat_history")]
    ChatHistory { messages: Vec<Message> },

    #[serde(rename = "new_message")]
    NewMessage { message: Message },

    #[serde(rename = "typing")]
    Typing { user_id: UserId, is_typing: bool },

    /// Non-fatal diagnostic from the peer side.
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerFrame {
    pub const TAGS: [&'static str; 4] = ["chat_history", "new_message", "typing", "error"];

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::ChatHistory { .. } => "chat_history",
            Self::NewMessage { .. } => "new_message",
            Self::Typing { .. } => "typing",
            Self::Error { .. } => "error",
        }
    }
}

/// Frames the client sends to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ClientFrame {
    #[serde(rename = "send_message")]
    SendMessage { content: String },

    #[serde(rename = "typing")]
    Typing { is_typing: bool },

    /// Read receipt for exactly one message.
    #[serde(rename = "mark_read")]
    MarkRead { message_id: MessageId },
}

impl ClientFrame {
    pub fn action(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
            Self::MarkRead { .. } => "mark_read",
        }
    }

    pub fn encode(&self) -> String {
        // Every variant is a plain struct of strings and bools.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Decode one inbound text frame.
///
/// Distinguishes an unknown `type` from a known type with a bad payload.
/// A `new_message` with empty content is malformed; empty-content entries in
/// `chat_history` are dropped so the rest of the history still applies.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(format!("invalid JSON: {e}")))?;

    let tag = value
        .get("type")
        .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".into()))?
        .as_str()
        .ok_or_else(|| ProtocolError::Malformed("\"type\" is not a string".into()))?;

    if !ServerFrame::TAGS.contains(&tag) {
        return Err(ProtocolError::UnknownTag(tag.to_owned()));
    }
    let tag = tag.to_owned();

    let mut frame: ServerFrame =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(format!("{tag}: {e}")))?;

    match &mut frame {
        ServerFrame::ChatHistory { messages } => messages.retain(|m| !m.content.is_empty()),
        ServerFrame::NewMessage { message } if message.content.is_empty() => {
            return Err(ProtocolError::Malformed(format!(
                "new_message: message {} has empty content",
                message.id
            )));
        }
        _ => {}
    }

    Ok(frame)
}
