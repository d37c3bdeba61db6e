use std::collections::HashSet;

use crate::ids::MessageId;
use crate::message::Message;

/// Outcome of inserting a single message into the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inserted {
    /// Appended after the previous tail.
    Appended,
    /// Older than the tail; placed at its ordered position.
    Reordered { index: usize },
    /// Already present (redelivery). Log unchanged.
    Duplicate,
}

/// In-memory message log ordered by `(created_at, id)` with unique ids.
#[derive(Clone, Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole log with a server-provided set.
    ///
    /// The set is expected to arrive ordered and unique; a stable sort and a
    /// first-wins dedup keep the invariants if it does not.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        let mut messages = messages;
        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        self.ids.clear();
        self.messages.clear();
        for message in messages {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }
    }

    pub fn insert(&mut self, message: Message) -> Inserted {
        if self.ids.contains(&message.id) {
            return Inserted::Duplicate;
        }
        let _ = self.ids.insert(message.id.clone());

        let in_order = self
            .messages
            .last()
            .map_or(true, |tail| tail.order_key() <= message.order_key());
        if in_order {
            self.messages.push(message);
            return Inserted::Appended;
        }

        let index = self
            .messages
            .partition_point(|m| m.order_key() <= message.order_key());
        self.messages.insert(index, message);
        Inserted::Reordered { index }
    }

    /// Mark one message read. Returns `None` for an unknown id, otherwise
    /// whether the flag changed.
    pub fn mark_read(&mut self, id: &MessageId) -> Option<bool> {
        self.messages
            .iter_mut()
            .find(|m| &m.id == id)
            .map(Message::mark_read)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.messages.iter().filter(|m| !m.is_read).count()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Sender;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn msg(id: &str, offset_secs: i64) -> Message {
        Message::new(
            id,
            format!("body {id}"),
            Sender::new("u1", "Ada"),
            base() + Duration::seconds(offset_secs),
        )
    }

    fn ids(log: &MessageLog) -> Vec<&str> {
        log.as_slice().iter().map(|m| m.id.as_str()).collect()
    }

    fn assert_invariants(log: &MessageLog) {
        for w in log.as_slice().windows(2) {
            assert!(w[0].order_key() < w[1].order_key(), "out of order: {} / {}", w[0].id, w[1].id);
        }
        assert_eq!(log.ids.len(), log.len());
    }

    #[test]
    fn in_order_messages_append() {
        let mut log = MessageLog::new();
        assert_eq!(log.insert(msg("1", 0)), Inserted::Appended);
        assert_eq!(log.insert(msg("2", 1)), Inserted::Appended);
        assert_eq!(ids(&log), vec!["1", "2"]);
    }

    #[test]
    fn redelivery_is_idempotent() {
        let mut log = MessageLog::new();
        let _ = log.insert(msg("1", 0));
        assert_eq!(log.insert(msg("1", 0)), Inserted::Duplicate);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn out_of_order_message_is_placed() {
        let mut log = MessageLog::new();
        let _ = log.insert(msg("1", 0));
        let _ = log.insert(msg("3", 10));
        assert_eq!(log.insert(msg("2", 5)), Inserted::Reordered { index: 1 });
        assert_eq!(ids(&log), vec!["1", "2", "3"]);
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let mut log = MessageLog::new();
        let _ = log.insert(msg("b", 0));
        let _ = log.insert(msg("a", 0));
        assert_eq!(ids(&log), vec!["a", "b"]);
    }

    #[test]
    fn arbitrary_sequences_keep_invariants() {
        // Deterministic shuffle with redelivery.
        let offsets = [7, 3, 3, 9, 0, 5, 7, 1, 9, 2, 2, 8, 4, 6, 0];
        let mut log = MessageLog::new();
        for (i, off) in offsets.iter().enumerate() {
            let _ = log.insert(msg(&format!("m{off}"), *off));
            if i % 3 == 0 {
                let _ = log.insert(msg(&format!("m{off}"), *off));
            }
            assert_invariants(&log);
        }
        assert_eq!(log.len(), 10);
    }

    #[test]
    fn replace_all_is_full_replace() {
        let mut log = MessageLog::new();
        let _ = log.insert(msg("old", 100));
        let _ = log.mark_read(&MessageId::from_raw("old"));

        let fresh = vec![msg("1", 0), msg("2", 1), msg("3", 2)];
        log.replace_all(fresh.clone());
        assert_eq!(log.as_slice(), fresh.as_slice());
        assert!(!log.contains(&MessageId::from_raw("old")));
    }

    #[test]
    fn replace_all_sorts_and_dedups() {
        let mut log = MessageLog::new();
        let mut dup = msg("1", 0);
        dup.content = "second copy".into();
        log.replace_all(vec![msg("2", 1), msg("1", 0), dup]);
        assert_eq!(ids(&log), vec!["1", "2"]);
        assert_eq!(log.as_slice()[0].content, "body 1");
        assert_invariants(&log);
    }

    #[test]
    fn mark_read_flips_once() {
        let mut log = MessageLog::new();
        let _ = log.insert(msg("1", 0));
        let _ = log.insert(msg("2", 1));
        let id = MessageId::from_raw("1");

        assert_eq!(log.mark_read(&id), Some(true));
        assert_eq!(log.mark_read(&id), Some(false));
        assert_eq!(log.mark_read(&MessageId::from_raw("nope")), None);
        assert!(log.get(&id).unwrap().is_read);
        assert!(!log.get(&MessageId::from_raw("2")).unwrap().is_read);
        assert_eq!(log.unread_count(), 1);
    }
}
