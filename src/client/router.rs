//! Named-event fan-out for inbound push frames.
//!
//! Handlers run synchronously on the connection task, in registration
//! order. A handler that needs to await must spawn its own task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::wire::{EventKind, ServerFrame};

pub type Handler = Arc<dyn Fn(&ServerFrame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct RouterInner {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
}

impl RouterInner {
    fn remove(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }
}

#[derive(Clone, Default)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. The handler stays registered until the
    /// returned guard is dropped or [`EventRouter::off`] is called.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerFrame) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        tracing::trace!(event = kind.as_str(), "Handler registered");

        Subscription {
            router: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Remove one handler. Returns false when it was already gone.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.inner.remove(kind, id)
    }

    /// Deliver `frame` to every handler registered for its kind.
    /// Returns how many handlers ran.
    pub fn dispatch(&self, frame: &ServerFrame) -> usize {
        let kind = frame.kind();
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(frame);
        }

        if handlers.is_empty() {
            tracing::debug!(event = kind.as_str(), "No handler for push event");
        }
        handlers.len()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Scoped registration returned by [`EventRouter::on`].
pub struct Subscription {
    router: Weak<RouterInner>,
    kind: EventKind,
    id: HandlerId,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.remove(self.kind, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ErrorPayload, NotificationSignal};
    use std::sync::Mutex;

    fn signal() -> ServerFrame {
        ServerFrame::NewNotification(NotificationSignal::default())
    }

    #[test]
    fn test_every_handler_receives_frame() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let seen = seen.clone();
            router.on(EventKind::NewNotification, move |_| seen.lock().unwrap().push("a"))
        };
        let b = {
            let seen = seen.clone();
            router.on(EventKind::NewNotification, move |_| seen.lock().unwrap().push("b"))
        };

        assert_eq!(router.dispatch(&signal()), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        drop((a, b));
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let router = EventRouter::new();
        let sub = router.on(EventKind::NewNotification, |_| {});
        assert_eq!(router.handler_count(EventKind::NewNotification), 1);

        drop(sub);
        assert_eq!(router.handler_count(EventKind::NewNotification), 0);
        assert_eq!(router.dispatch(&signal()), 0);
    }

    #[test]
    fn test_off_then_drop_is_harmless() {
        let router = EventRouter::new();
        let keep = router.on(EventKind::NewNotification, |_| {});
        let sub = router.on(EventKind::NewNotification, |_| {});

        assert!(router.off(sub.kind(), sub.id()));
        assert!(!router.off(sub.kind(), sub.id()));
        drop(sub);
        assert_eq!(router.handler_count(EventKind::NewNotification), 1);
        drop(keep);
    }

    #[test]
    fn test_dispatch_only_matches_kind() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicU64::new(0));
        let _sub = {
            let hits = hits.clone();
            router.on(EventKind::Error, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        router.dispatch(&signal());
        router.dispatch(&ServerFrame::Error(ErrorPayload {
            code: 400,
            message: "bad".to_string(),
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_subscribe_during_dispatch() {
        let router = EventRouter::new();
        let late: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let inner = router.clone();
            let late = late.clone();
            router.on(EventKind::NewNotification, move |_| {
                late.lock().unwrap().push(inner.on(EventKind::NewPost, |_| {}));
            })
        };

        router.dispatch(&signal());
        assert_eq!(router.handler_count(EventKind::NewPost), 1);
    }
}
