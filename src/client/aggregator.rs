use tokio::sync::watch;

use super::notifications::{self, NotificationStore};
use super::store::{self, Conversation, ConversationStore};
use crate::wire::Notification;

/// Badges cap at this value and render as "9+" above it.
pub const BADGE_CEILING: u64 = 9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadTotals {
    pub messages: u64,
    pub notifications: u64,
}

impl UnreadTotals {
    pub fn message_badge(&self) -> Option<String> {
        badge_label(self.messages)
    }

    pub fn notification_badge(&self) -> Option<String> {
        badge_label(self.notifications)
    }
}

/// Badge text for `count`; `None` hides the badge.
pub fn badge_label(count: u64) -> Option<String> {
    match count {
        0 => None,
        n if n > BADGE_CEILING => Some(format!("{BADGE_CEILING}+")),
        n => Some(n.to_string()),
    }
}

/// Derived unread totals. Holds no state of its own, so the totals always
/// equal the sum over the current store contents.
pub struct UnreadAggregator {
    conversations: watch::Receiver<Vec<Conversation>>,
    notifications: watch::Receiver<Vec<Notification>>,
}

impl UnreadAggregator {
    pub fn new(conversations: &ConversationStore, notifications: &NotificationStore) -> Self {
        Self {
            conversations: conversations.subscribe(),
            notifications: notifications.subscribe(),
        }
    }

    pub fn total_unread_messages(&self) -> u64 {
        store::total_unread(&self.conversations.borrow())
    }

    pub fn total_unread_notifications(&self) -> u64 {
        notifications::unread_count(&self.notifications.borrow())
    }

    pub fn totals(&self) -> UnreadTotals {
        UnreadTotals {
            messages: self.total_unread_messages(),
            notifications: self.total_unread_notifications(),
        }
    }

    /// Wait until either store changes, then return fresh totals.
    /// `None` once both stores are gone.
    pub async fn changed(&mut self) -> Option<UnreadTotals> {
        tokio::select! {
            Ok(()) = self.conversations.changed() => {}
            Ok(()) = self.notifications.changed() => {}
            else => return None,
        }
        self.conversations.mark_unchanged();
        self.notifications.mark_unchanged();
        Some(self.totals())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::notifications::tests::notification;
    use crate::client::store::tests::{message, summary};

    #[test]
    fn test_badge_label() {
        assert_eq!(badge_label(0), None);
        assert_eq!(badge_label(1).as_deref(), Some("1"));
        assert_eq!(badge_label(9).as_deref(), Some("9"));
        assert_eq!(badge_label(10).as_deref(), Some("9+"));
        assert_eq!(badge_label(250).as_deref(), Some("9+"));
    }

    #[test]
    fn test_totals_track_store_mutations() {
        let conversations = ConversationStore::new();
        let notes = NotificationStore::new();
        let aggregator = UnreadAggregator::new(&conversations, &notes);

        conversations.replace_all(vec![summary("u2", 5, 3), summary("u3", 4, 8)]);
        notes.replace_all(vec![notification("n1", 1, false), notification("n2", 2, true)]);
        assert_eq!(aggregator.totals(), UnreadTotals { messages: 11, notifications: 1 });
        assert_eq!(aggregator.totals().message_badge().as_deref(), Some("9+"));

        conversations.upsert_from_incoming("u2", &message("m1", "u2", "me", 9), false);
        assert_eq!(aggregator.total_unread_messages(), conversations.total_unread());

        conversations.mark_read("u3");
        assert_eq!(aggregator.total_unread_messages(), 4);
        assert_eq!(aggregator.totals().notification_badge().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_changed_wakes_on_either_store() {
        let conversations = ConversationStore::new();
        let notes = NotificationStore::new();
        let mut aggregator = UnreadAggregator::new(&conversations, &notes);

        notes.replace_all(vec![notification("n1", 1, false)]);
        let totals = aggregator.changed().await.unwrap();
        assert_eq!(totals.notifications, 1);

        conversations.replace_all(vec![summary("u2", 5, 2)]);
        let totals = aggregator.changed().await.unwrap();
        assert_eq!(totals.messages, 2);
    }
}
