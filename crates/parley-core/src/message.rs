use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, UserId};

/// Author of a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

impl Sender {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }
}

/// A server-assigned chat message. Only `is_read` ever changes after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    pub fn new(
        id: impl Into<MessageId>,
        content: impl Into<String>,
        sender: Sender,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            sender,
            created_at,
            is_read: false,
        }
    }

    /// Total order within a conversation: server timestamp, then id.
    pub fn order_key(&self) -> (&DateTime<Utc>, &MessageId) {
        (&self.created_at, &self.id)
    }

    /// Flip the read flag. Returns whether anything changed.
    pub fn mark_read(&mut self) -> bool {
        !std::mem::replace(&mut self.is_read, true)
    }
}
