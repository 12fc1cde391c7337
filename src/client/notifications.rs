use std::sync::Arc;

use tokio::sync::watch;

use crate::wire::Notification;

/// Notification list, newest first, shared through a `watch` channel.
#[derive(Clone)]
pub struct NotificationStore {
    tx: Arc<watch::Sender<Vec<Notification>>>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn replace_all(&self, mut snapshot: Vec<Notification>) {
        snapshot.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.tx.send_replace(snapshot);
    }

    pub fn mark_read(&self, id: &str) -> bool {
        self.tx.send_if_modified(|list| {
            match list.iter_mut().find(|n| n.id == id && !n.is_read) {
                Some(n) => {
                    n.is_read = true;
                    true
                }
                None => false,
            }
        })
    }

    /// Returns how many entries flipped to read.
    pub fn mark_all_read(&self) -> usize {
        let mut flipped = 0;
        self.tx.send_if_modified(|list| {
            for n in list.iter_mut().filter(|n| !n.is_read) {
                n.is_read = true;
                flipped += 1;
            }
            flipped > 0
        });
        flipped
    }

    pub fn unread_count(&self) -> u64 {
        unread_count(&self.tx.borrow())
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.tx.subscribe()
    }
}

pub(crate) fn unread_count(list: &[Notification]) -> u64 {
    list.iter().filter(|n| !n.is_read).count() as u64
}
