//! Merges REST snapshots with live pushes.
//!
//! The reconciler owns the focused thread and is the only writer of the
//! conversation and notification stores. Three rules hold throughout:
//!
//! - Opening a thread runs history fetch, then the read receipt, then the
//!   conversation snapshot refresh, strictly in that order, so the snapshot
//!   already reflects the receipt.
//! - Every async step carries a focus ticket; a result that arrives after
//!   the user moved to another thread is dropped.
//! - A sent message enters the thread only once the server has assigned
//!   its id. Until then it lives in the outbox.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

use super::api::DeliveryApi;
use super::error::ClientError;
use super::notifications::NotificationStore;
use super::store::{ConversationStore, UpsertOutcome};
use crate::wire::{ClientFrame, Message};

/// Outbound half of the push channel as the reconciler sees it.
pub trait PushSink: Send + Sync {
    fn emit(&self, frame: ClientFrame) -> Result<(), ClientError>;
}

/// How many recently applied push ids are remembered for dedup.
const RECENT_IDS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxState {
    Sending,
    Failed { reason: String },
}

/// A message the user submitted that the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub local_id: Uuid,
    pub receiver_id: String,
    pub content: String,
    pub state: OutboxState,
}

/// Messages of the focused conversation plus its unconfirmed sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadBuffer {
    pub counterpart: Option<String>,
    pub messages: Vec<Message>,
    pub outbox: Vec<OutboxEntry>,
    /// True until the first history fetch for this counterpart lands.
    pub loading: bool,
}

impl ThreadBuffer {
    fn opened(counterpart: &str) -> Self {
        Self {
            counterpart: Some(counterpart.to_string()),
            loading: true,
            ..Self::default()
        }
    }

    pub fn is_for(&self, counterpart: &str) -> bool {
        self.counterpart.as_deref() == Some(counterpart)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    fn append(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// History becomes the base; live messages that arrived while it was
    /// in flight stay at the end.
    fn merge_history(&mut self, history: Vec<Message>) {
        let mut seen = HashSet::with_capacity(history.len());
        let mut merged = Vec::with_capacity(history.len() + self.messages.len());
        for message in history.into_iter().chain(self.messages.drain(..)) {
            if seen.insert(message.id.clone()) {
                merged.push(message);
            }
        }
        self.messages = merged;
        self.loading = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    /// Another conversation was opened (or this one closed) before the
    /// sequence finished.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingOutcome {
    Duplicate,
    Applied {
        appended: bool,
        store: UpsertOutcome,
    },
}

#[derive(Debug, Default)]
struct Focus {
    counterpart: Option<String>,
    generation: u64,
    /// The server acknowledged the read receipt for this focus.
    read_confirmed: bool,
}

#[derive(Debug, Clone)]
struct FocusTicket {
    counterpart: String,
    generation: u64,
}

#[derive(Default)]
struct RecentIds {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl RecentIds {
    /// Returns false when `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() == RECENT_IDS {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.set.insert(id.to_string());
        true
    }
}

struct Inner {
    self_id: String,
    api: Arc<dyn DeliveryApi>,
    push: Arc<dyn PushSink>,
    conversations: ConversationStore,
    notifications: NotificationStore,
    focus: Mutex<Focus>,
    recent: Mutex<RecentIds>,
    thread: watch::Sender<ThreadBuffer>,
}

#[derive(Clone)]
pub struct DeliveryReconciler {
    inner: Arc<Inner>,
}

impl DeliveryReconciler {
    pub fn new(
        self_id: impl Into<String>,
        api: Arc<dyn DeliveryApi>,
        push: Arc<dyn PushSink>,
        conversations: ConversationStore,
        notifications: NotificationStore,
    ) -> Self {
        let (thread, _rx) = watch::channel(ThreadBuffer::default());
        Self {
            inner: Arc::new(Inner {
                self_id: self_id.into(),
                api,
                push,
                conversations,
                notifications,
                focus: Mutex::new(Focus::default()),
                recent: Mutex::new(RecentIds::default()),
                thread,
            }),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.inner.self_id
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.inner.conversations
    }

    pub fn notifications(&self) -> &NotificationStore {
        &self.inner.notifications
    }

    pub fn thread(&self) -> watch::Receiver<ThreadBuffer> {
        self.inner.thread.subscribe()
    }

    pub fn thread_snapshot(&self) -> ThreadBuffer {
        self.inner.thread.borrow().clone()
    }

    pub fn focused(&self) -> Option<String> {
        self.lock_focus().counterpart.clone()
    }

    fn lock_focus(&self) -> std::sync::MutexGuard<'_, Focus> {
        self.inner.focus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_ticket(&self) -> Option<FocusTicket> {
        let focus = self.lock_focus();
        focus.counterpart.as_ref().map(|counterpart| FocusTicket {
            counterpart: counterpart.clone(),
            generation: focus.generation,
        })
    }

    /// The focused counterpart whose read receipt has landed. Snapshots
    /// zero only this one; before the receipt the server count is real.
    fn read_focus(&self) -> Option<String> {
        let focus = self.lock_focus();
        focus.counterpart.clone().filter(|_| focus.read_confirmed)
    }

    fn confirm_read(&self, ticket: &FocusTicket) {
        let mut focus = self.lock_focus();
        if focus.generation == ticket.generation {
            focus.read_confirmed = true;
        }
    }

    /// Undo an interrupted open: stop loading and show the unread count
    /// that was there before, while focus is still on the same thread.
    fn abandon_open(&self, ticket: &FocusTicket, previous_unread: Option<u32>) {
        if !self.is_current(ticket) {
            return;
        }
        self.inner.thread.send_if_modified(|thread| {
            if !thread.is_for(&ticket.counterpart) || !thread.loading {
                return false;
            }
            thread.loading = false;
            true
        });
        if let Some(count) = previous_unread {
            self.inner
                .conversations
                .restore_unread(&ticket.counterpart, count);
        }
    }

    fn is_current(&self, ticket: &FocusTicket) -> bool {
        let focus = self.lock_focus();
        focus.generation == ticket.generation
            && focus.counterpart.as_deref() == Some(ticket.counterpart.as_str())
    }

    /// Focus `counterpart_id` and load its thread.
    ///
    /// Runs history, then the read receipt, then the list refresh. Returns
    /// [`OpenOutcome::Superseded`] when focus moved on before the sequence
    /// finished; results for the old thread are then discarded. If history
    /// or the receipt fails, the thread stops loading and the conversation
    /// keeps its previous unread count.
    pub async fn open_conversation(&self, counterpart_id: &str) -> Result<OpenOutcome, ClientError> {
        let ticket = {
            let mut focus = self.lock_focus();
            focus.generation += 1;
            focus.counterpart = Some(counterpart_id.to_string());
            focus.read_confirmed = false;
            FocusTicket {
                counterpart: counterpart_id.to_string(),
                generation: focus.generation,
            }
        };
        self.inner.thread.send_replace(ThreadBuffer::opened(counterpart_id));
        let previous_unread = self
            .inner
            .conversations
            .get(counterpart_id)
            .map(|c| c.unread_count);
        self.inner.conversations.mark_read(counterpart_id);

        tracing::debug!(counterpart = %counterpart_id, generation = ticket.generation, "Opening conversation");

        let history = match self.inner.api.fetch_history(counterpart_id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(counterpart = %counterpart_id, error = %e, "History fetch failed");
                self.abandon_open(&ticket, previous_unread);
                return Err(e);
            }
        };

        if !self.is_current(&ticket) {
            tracing::debug!(counterpart = %counterpart_id, "Discarding history for stale focus");
            return Ok(OpenOutcome::Superseded);
        }
        self.inner.thread.send_if_modified(|thread| {
            if !thread.is_for(counterpart_id) {
                return false;
            }
            thread.merge_history(history);
            true
        });

        // The snapshot must be read after the receipt lands, or it would
        // still carry the unread count this open just cleared.
        if let Err(e) = self.inner.api.mark_conversation_read(counterpart_id).await {
            tracing::warn!(counterpart = %counterpart_id, error = %e, "Read receipt failed");
            self.abandon_open(&ticket, previous_unread);
            return Err(e);
        }
        self.confirm_read(&ticket);
        self.refresh_conversations().await?;

        if self.is_current(&ticket) {
            Ok(OpenOutcome::Opened)
        } else {
            Ok(OpenOutcome::Superseded)
        }
    }

    /// Drop focus. In-flight steps for the old thread finish and are ignored.
    pub fn close_conversation(&self) {
        {
            let mut focus = self.lock_focus();
            focus.generation += 1;
            focus.counterpart = None;
            focus.read_confirmed = false;
        }
        self.inner.thread.send_replace(ThreadBuffer::default());
    }

    /// Apply one pushed `new-message`.
    pub fn handle_incoming(&self, message: Message) -> IncomingOutcome {
        let fresh = self
            .inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&message.id);
        if !fresh {
            tracing::debug!(message_id = %message.id, "Ignoring duplicate push");
            return IncomingOutcome::Duplicate;
        }

        let counterpart = message.counterpart_of(&self.inner.self_id).to_string();
        let focused = self.focused().as_deref() == Some(counterpart.as_str());

        let mut appended = false;
        if focused {
            appended = self.inner.thread.send_if_modified(|thread| {
                thread.is_for(&counterpart) && thread.append(message.clone())
            });
            if message.sender.id == counterpart {
                self.spawn_read_receipt(counterpart.clone());
            }
        }

        let store = self
            .inner
            .conversations
            .upsert_from_incoming(&counterpart, &message, focused);
        if store == UpsertOutcome::NeedsRefresh {
            tracing::debug!(counterpart = %counterpart, "New conversation, refreshing list");
            self.spawn_refresh();
        }

        IncomingOutcome::Applied { appended, store }
    }

    fn spawn_read_receipt(&self, counterpart: String) {
        let api = Arc::clone(&self.inner.api);
        tokio::spawn(async move {
            if let Err(e) = api.mark_conversation_read(&counterpart).await {
                tracing::warn!(counterpart = %counterpart, error = %e, "Read receipt failed");
            }
        });
    }

    fn spawn_refresh(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.refresh_conversations().await {
                tracing::warn!(error = %e, "Conversation refresh failed");
            }
        });
    }

    /// Send `content` to `receiver_id`.
    ///
    /// The entry waits in the outbox until the server returns the stored
    /// message. On failure it stays there as `Failed` and the error is
    /// returned. On success the message is appended, relayed over the push
    /// channel and folded into the conversation list.
    pub async fn send_message(&self, receiver_id: &str, content: &str) -> Result<Message, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        let local_id = Uuid::new_v4();
        self.inner.thread.send_if_modified(|thread| {
            if !thread.is_for(receiver_id) {
                return false;
            }
            thread.outbox.push(OutboxEntry {
                local_id,
                receiver_id: receiver_id.to_string(),
                content: content.to_string(),
                state: OutboxState::Sending,
            });
            true
        });

        let message = match self.inner.api.send_message(receiver_id, content).await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(receiver_id = %receiver_id, error = %e, "Send failed");
                let reason = e.to_string();
                self.inner.thread.send_if_modified(|thread| {
                    match thread.outbox.iter_mut().find(|entry| entry.local_id == local_id) {
                        Some(entry) => {
                            entry.state = OutboxState::Failed { reason };
                            true
                        }
                        None => false,
                    }
                });
                return Err(e);
            }
        };

        self.inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&message.id);

        self.inner.thread.send_if_modified(|thread| {
            let before = thread.outbox.len();
            thread.outbox.retain(|entry| entry.local_id != local_id);
            let removed = thread.outbox.len() != before;
            let appended = thread.is_for(receiver_id) && thread.append(message.clone());
            removed || appended
        });

        if let Err(e) = self.inner.push.emit(ClientFrame::SendMessage(message.clone())) {
            // Stored already; the receiver sees it on their next fetch.
            tracing::warn!(message_id = %message.id, error = %e, "Push relay failed");
        }

        match self
            .inner
            .conversations
            .upsert_from_incoming(receiver_id, &message, true)
        {
            UpsertOutcome::Updated => {}
            UpsertOutcome::NeedsRefresh => {
                if let Err(e) = self.refresh_conversations().await {
                    tracing::warn!(error = %e, "Conversation refresh after send failed");
                }
            }
        }

        tracing::debug!(message_id = %message.id, receiver_id = %receiver_id, "Message sent");
        Ok(message)
    }

    /// Remove a failed outbox entry, handing it back so the text can be
    /// restored to the compose box.
    pub fn discard_failed(&self, local_id: Uuid) -> Option<OutboxEntry> {
        let mut taken = None;
        self.inner.thread.send_if_modified(|thread| {
            let index = thread.outbox.iter().position(|entry| {
                entry.local_id == local_id && matches!(entry.state, OutboxState::Failed { .. })
            });
            match index {
                Some(index) => {
                    taken = Some(thread.outbox.remove(index));
                    true
                }
                None => false,
            }
        });
        taken
    }

    /// Replace the conversation list with the server's. The focused
    /// conversation keeps a zero unread count once its read receipt has
    /// landed. On failure the list is left as it was.
    pub async fn refresh_conversations(&self) -> Result<(), ClientError> {
        let snapshot = self.inner.api.fetch_conversations().await?;
        let focused = self.read_focus();
        self.inner
            .conversations
            .replace_all_keeping_read(snapshot, focused.as_deref());
        Ok(())
    }

    pub async fn refresh_notifications(&self) -> Result<(), ClientError> {
        let snapshot = self.inner.api.fetch_notifications().await?;
        self.inner.notifications.replace_all(snapshot);
        Ok(())
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<(), ClientError> {
        self.inner.api.mark_notification_read(notification_id).await?;
        self.inner.notifications.mark_read(notification_id);
        Ok(())
    }

    pub async fn mark_all_notifications_read(&self) -> Result<(), ClientError> {
        self.inner.api.mark_all_notifications_read().await?;
        self.inner.notifications.mark_all_read();
        Ok(())
    }

    /// Catch up after the push link was re-established: refresh both lists
    /// and re-merge the focused thread's history. Every step runs; the
    /// first error is returned.
    pub async fn resync(&self) -> Result<(), ClientError> {
        let conversations = self.refresh_conversations().await;
        let notifications = self.refresh_notifications().await;

        let history = match self.current_ticket() {
            Some(ticket) => match self.inner.api.fetch_history(&ticket.counterpart).await {
                Ok(history) => {
                    if self.is_current(&ticket) {
                        self.inner.thread.send_if_modified(|thread| {
                            if !thread.is_for(&ticket.counterpart) {
                                return false;
                            }
                            thread.merge_history(history);
                            true
                        });
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => Ok(()),
        };

        conversations.and(notifications).and(history)
    }
}
