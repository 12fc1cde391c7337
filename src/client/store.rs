//! Conversation list state.
//!
//! Kept on a `watch` channel so each mutation is one atomic replace or merge
//! and readers always see a complete, sorted list.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::wire::{ConversationSummary, Message, UserSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub counterpart: UserSummary,
    pub last_message: String,
    pub last_message_time: DateTime<Utc>,
    pub unread_count: u32,
}

impl From<ConversationSummary> for Conversation {
    fn from(summary: ConversationSummary) -> Self {
        Self {
            counterpart: summary.user,
            last_message: summary.last_message,
            last_message_time: summary.last_message_time,
            unread_count: summary.unread_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Updated,
    /// The counterpart has no entry yet; the caller re-fetches the list.
    NeedsRefresh,
}

#[derive(Clone)]
pub struct ConversationStore {
    tx: Arc<watch::Sender<Vec<Conversation>>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_newest_first(list: &mut [Conversation]) {
    list.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
}

impl ConversationStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn replace_all(&self, snapshot: Vec<ConversationSummary>) {
        self.replace_all_keeping_read(snapshot, None);
    }

    /// Replace the list with a server snapshot. `focused` keeps its unread
    /// count at zero in the same update.
    pub fn replace_all_keeping_read(&self, snapshot: Vec<ConversationSummary>, focused: Option<&str>) {
        let mut list: Vec<Conversation> = snapshot.into_iter().map(Conversation::from).collect();
        if let Some(focused) = focused {
            for entry in list.iter_mut().filter(|c| c.counterpart.id == focused) {
                entry.unread_count = 0;
            }
        }
        sort_newest_first(&mut list);
        self.tx.send_replace(list);
    }

    /// Fold a message into its conversation entry and move the entry to the
    /// front. Unread grows only for messages authored by the counterpart
    /// while that conversation is not focused. A message older than the
    /// entry's current last message leaves preview and position alone.
    pub fn upsert_from_incoming(
        &self,
        counterpart_id: &str,
        message: &Message,
        is_focused: bool,
    ) -> UpsertOutcome {
        let mut outcome = UpsertOutcome::NeedsRefresh;
        self.tx.send_if_modified(|list| {
            let Some(index) = list.iter().position(|c| c.counterpart.id == counterpart_id) else {
                return false;
            };
            outcome = UpsertOutcome::Updated;

            let mut entry = list.remove(index);
            if message.created_at >= entry.last_message_time {
                entry.last_message = message.content.clone();
                entry.last_message_time = message.created_at;
            }
            if !is_focused && message.sender.id == counterpart_id {
                entry.unread_count = entry.unread_count.saturating_add(1);
            }

            let at = list
                .iter()
                .position(|c| c.last_message_time <= entry.last_message_time)
                .unwrap_or(list.len());
            list.insert(at, entry);
            true
        });
        outcome
    }

    /// Zero the unread count for `counterpart_id`. Returns whether anything changed.
    pub fn mark_read(&self, counterpart_id: &str) -> bool {
        self.tx.send_if_modified(|list| {
            match list
                .iter_mut()
                .find(|c| c.counterpart.id == counterpart_id && c.unread_count > 0)
            {
                Some(entry) => {
                    entry.unread_count = 0;
                    true
                }
                None => false,
            }
        })
    }

    /// Put back an unread count cleared by an open that did not complete.
    /// Only a zero count is overwritten.
    pub fn restore_unread(&self, counterpart_id: &str, count: u32) -> bool {
        self.tx.send_if_modified(|list| {
            match list
                .iter_mut()
                .find(|c| c.counterpart.id == counterpart_id && c.unread_count == 0)
            {
                Some(entry) if count > 0 => {
                    entry.unread_count = count;
                    true
                }
                _ => false,
            }
        })
    }

    pub fn snapshot(&self) -> Vec<Conversation> {
        self.tx.borrow().clone()
    }

    pub fn get(&self, counterpart_id: &str) -> Option<Conversation> {
        self.tx
            .borrow()
            .iter()
            .find(|c| c.counterpart.id == counterpart_id)
            .cloned()
    }

    pub fn total_unread(&self) -> u64 {
        total_unread(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Conversation>> {
        self.tx.subscribe()
    }
}

pub(crate) fn total_unread(list: &[Conversation]) -> u64 {
    list.iter().map(|c| u64::from(c.unread_count)).sum()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, minute, 0).unwrap()
    }

    pub(crate) fn user(id: &str) -> UserSummary {
        UserSummary {
            id: id.to_string(),
            username: format!("{id}-name"),
            full_name: String::new(),
            profile_picture: String::new(),
        }
    }

    pub(crate) fn summary(id: &str, minute: u32, unread: u32) -> ConversationSummary {
        ConversationSummary {
            user: user(id),
            last_message: format!("last from {id}"),
            last_message_time: at(minute),
            unread_count: unread,
        }
    }

    pub(crate) fn message(id: &str, from: &str, to: &str, minute: u32) -> Message {
        Message {
            id: id.to_string(),
            sender: user(from),
            receiver_id: to.to_string(),
            content: format!("body of {id}"),
            created_at: at(minute),
            is_read: false,
        }
    }

    fn order(store: &ConversationStore) -> Vec<String> {
        store.snapshot().into_iter().map(|c| c.counterpart.id).collect()
    }

    #[test]
    fn test_replace_all_sorts_newest_first() {
        let store = ConversationStore::new();
        store.replace_all(vec![summary("u2", 1, 0), summary("u3", 5, 2), summary("u4", 3, 0)]);
        assert_eq!(order(&store), vec!["u3", "u4", "u2"]);
        assert_eq!(store.total_unread(), 2);
    }

    #[test]
    fn test_upsert_moves_to_front_and_counts() {
        let store = ConversationStore::new();
        store.replace_all(vec![summary("u2", 5, 0), summary("u3", 1, 0)]);

        let outcome = store.upsert_from_incoming("u3", &message("m1", "u3", "me", 9), false);
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(order(&store), vec!["u3", "u2"]);

        let entry = store.get("u3").unwrap();
        assert_eq!(entry.unread_count, 1);
        assert_eq!(entry.last_message, "body of m1");
        assert_eq!(entry.last_message_time, at(9));
    }

    #[test]
    fn test_upsert_focused_does_not_count() {
        let store = ConversationStore::new();
        store.replace_all(vec![summary("u2", 5, 0)]);
        store.upsert_from_incoming("u2", &message("m1", "u2", "me", 6), true);
        assert_eq!(store.get("u2").unwrap().unread_count, 0);
    }

    #[test]
    fn test_own_message_never_counts() {
        let store = ConversationStore::new();
        store.replace_all(vec![summary("u2", 5, 0)]);
        store.upsert_from_incoming("u2", &message("m1", "me", "u2", 6), false);
        assert_eq!(store.get("u2").unwrap().unread_count, 0);
        assert_eq!(store.get("u2").unwrap().last_message, "body of m1");
    }

    #[test]
    fn test_unknown_counterpart_needs_refresh() {
        let store = ConversationStore::new();
        store.replace_all(vec![summary("u2", 5, 0)]);
        let mut rx = store.subscribe();
        rx.mark_unchanged();

        let outcome = store.upsert_from_incoming("u9", &message("m1", "u9", "me", 6), false);
        assert_eq!(outcome, UpsertOutcome::NeedsRefresh);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_older_message_keeps_preview() {
        let store = ConversationStore::new();
        store.replace_all(vec![summary("u2", 8, 0), summary("u3", 5, 0)]);
        store.upsert_from_incoming("u2", &message("m0", "u2", "me", 2), false);

        let entry = store.get("u2").unwrap();
        assert_eq!(entry.last_message, "last from u2");
        assert_eq!(entry.unread_count, 1);
        assert_eq!(order(&store), vec!["u2", "u3"]);
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let store = ConversationStore::new();
        store.replace_all(vec![summary("u2", 5, 3)]);
        assert!(store.mark_read("u2"));
        let first = store.snapshot();
        assert!(!store.mark_read("u2"));
        assert_eq!(store.snapshot(), first);
        assert!(!store.mark_read("nobody"));
    }

    #[test]
    fn test_restore_unread_only_fills_zero() {
        let store = ConversationStore::new();
        store.replace_all(vec![summary("u2", 5, 4)]);
        assert!(!store.restore_unread("u2", 7));
        assert!(store.mark_read("u2"));
        assert!(store.restore_unread("u2", 4));
        assert_eq!(store.get("u2").unwrap().unread_count, 4);
        assert!(!store.restore_unread("missing", 2));
    }

    #[test]
    fn test_replace_keeping_read_zeroes_focused() {
        let store = ConversationStore::new();
        store.replace_all_keeping_read(vec![summary("u2", 5, 4), summary("u3", 2, 1)], Some("u2"));
        assert_eq!(store.get("u2").unwrap().unread_count, 0);
        assert_eq!(store.total_unread(), 1);
    }
}
