use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::aggregator::UnreadAggregator;
use super::api::{DeliveryApi, HttpApi};
use super::config::ClientConfig;
use super::connection::{ConnectionHandle, ConnectionManager, ConnectionSettings, LinkState};
use super::error::ClientError;
use super::notifications::NotificationStore;
use super::reconciler::DeliveryReconciler;
use super::router::{EventRouter, Subscription};
use super::store::ConversationStore;
use crate::wire::{EventKind, ServerFrame};

/// Everything one signed-in user needs: push link, stores, reconciler and
/// the background tasks that keep them fresh.
///
/// Dropping the session stops its tasks and cancels the link;
/// [`ClientSession::shutdown`] also waits for the link to close.
pub struct ClientSession {
    user_id: String,
    router: EventRouter,
    manager: ConnectionManager,
    handle: ConnectionHandle,
    reconciler: DeliveryReconciler,
    posts: Option<mpsc::UnboundedReceiver<serde_json::Value>>,
    subscriptions: Vec<Subscription>,
    background: Vec<JoinHandle<()>>,
}

impl ClientSession {
    /// Start a session against the relay named in `config`.
    pub async fn start(
        config: &ClientConfig,
        user_id: &str,
        token: &str,
    ) -> Result<Self, ClientError> {
        let api = Arc::new(HttpApi::new(config, token));
        Self::start_with_api(config, user_id, token, api).await
    }

    pub async fn start_with_api(
        config: &ClientConfig,
        user_id: &str,
        token: &str,
        api: Arc<dyn DeliveryApi>,
    ) -> Result<Self, ClientError> {
        let settings = ConnectionSettings::from_config(config, token)?;
        let router = EventRouter::new();
        let manager = ConnectionManager::new(settings, router.clone());
        let handle = manager.connect(user_id);

        let reconciler = DeliveryReconciler::new(
            user_id,
            api,
            Arc::new(handle.clone()),
            ConversationStore::new(),
            NotificationStore::new(),
        );

        let (posts_tx, posts_rx) = mpsc::unbounded_channel();
        let subscriptions = subscribe_handlers(&router, &reconciler, posts_tx);

        if let Err(e) = reconciler.refresh_conversations().await {
            tracing::warn!(user_id = %user_id, error = %e, "Initial conversation load failed");
        }
        if let Err(e) = reconciler.refresh_notifications().await {
            tracing::warn!(user_id = %user_id, error = %e, "Initial notification load failed");
        }

        let mut background = vec![tokio::spawn(resync_on_reconnect(
            handle.clone(),
            reconciler.clone(),
        ))];
        if let Some(interval) = config.reconcile_interval() {
            background.push(tokio::spawn(reconcile_poll(reconciler.clone(), interval)));
        }

        tracing::info!(user_id = %user_id, "Client session started");

        Ok(Self {
            user_id: user_id.to_string(),
            router,
            manager,
            handle,
            reconciler,
            posts: Some(posts_rx),
            subscriptions,
            background,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn reconciler(&self) -> &DeliveryReconciler {
        &self.reconciler
    }

    /// For views that react to push events directly.
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn aggregator(&self) -> UnreadAggregator {
        UnreadAggregator::new(self.reconciler.conversations(), self.reconciler.notifications())
    }

    /// Posts pushed by the server, in arrival order. Can be taken once.
    pub fn take_post_feed(&mut self) -> Option<mpsc::UnboundedReceiver<serde_json::Value>> {
        self.posts.take()
    }

    pub async fn shutdown(&mut self) {
        self.stop_background();
        self.manager.disconnect().await;
        tracing::info!(user_id = %self.user_id, "Client session stopped");
    }

    fn stop_background(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
        self.subscriptions.clear();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.stop_background();
        self.manager.cancel_current();
    }
}

fn subscribe_handlers(
    router: &EventRouter,
    reconciler: &DeliveryReconciler,
    posts: mpsc::UnboundedSender<serde_json::Value>,
) -> Vec<Subscription> {
    let on_message = {
        let reconciler = reconciler.clone();
        router.on(EventKind::NewMessage, move |frame| {
            if let ServerFrame::NewMessage(message) = frame {
                reconciler.handle_incoming(message.clone());
            }
        })
    };

    // The signal carries no payload worth trusting; re-fetch the list.
    let on_notification = {
        let reconciler = reconciler.clone();
        router.on(EventKind::NewNotification, move |_| {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                if let Err(e) = reconciler.refresh_notifications().await {
                    tracing::warn!(error = %e, "Notification refresh failed");
                }
            });
        })
    };

    let on_post = router.on(EventKind::NewPost, move |frame| {
        if let ServerFrame::NewPost(post) = frame {
            let _ = posts.send(post.clone());
        }
    });

    vec![on_message, on_notification, on_post]
}

/// Resync whenever the link comes back after having been connected once.
///
/// Driven by the connect count, not by observing each `Connected`: the
/// watch keeps only the latest state, so a quick drop and reconnect can
/// show up as one unchanged value.
async fn resync_on_reconnect(handle: ConnectionHandle, reconciler: DeliveryReconciler) {
    let mut state = handle.watch_state();
    let mut synced_through: u64 = 1;

    loop {
        let connects = handle.connect_count();
        if connects > synced_through {
            synced_through = connects;
            tracing::info!(user_id = %reconciler.self_id(), connects, "Push link restored, resyncing");
            if let Err(e) = reconciler.resync().await {
                tracing::warn!(error = %e, "Resync after reconnect failed");
            }
            continue;
        }
        if *state.borrow_and_update() == LinkState::Closed {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Periodic refresh so missed pushes converge within one interval.
async fn reconcile_poll(reconciler: DeliveryReconciler, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        ticker.tick().await;
        tracing::debug!(user_id = %reconciler.self_id(), "Reconciliation poll");
        if let Err(e) = reconciler.refresh_conversations().await {
            tracing::warn!(error = %e, "Conversation poll failed");
        }
        if let Err(e) = reconciler.refresh_notifications().await {
            tracing::warn!(error = %e, "Notification poll failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::reconciler::tests::{FakeApi, ME};
    use crate::client::store::tests::{message, summary};
    use crate::wire::NotificationSignal;
    use serde_json::json;
    use std::time::Duration;

    fn offline_config() -> ClientConfig {
        ClientConfig {
            server_url: "http://127.0.0.1:9".to_string(),
            reconnect_base_ms: 50,
            reconnect_max_ms: 100,
            reconcile_interval_secs: 0,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_session_routes_pushes_into_stores() {
        let api = Arc::new(FakeApi::default());
        *api.conversations.lock().unwrap() = vec![summary("u2", 5, 0)];

        let mut session = ClientSession::start_with_api(&offline_config(), ME, "t", api.clone())
            .await
            .unwrap();
        assert_eq!(session.reconciler().conversations().snapshot().len(), 1);
        assert_eq!(api.count("notifications"), 1);

        session
            .router()
            .dispatch(&ServerFrame::NewMessage(message("m1", "u2", ME, 20)));
        assert_eq!(session.aggregator().total_unread_messages(), 1);

        let mut feed = session.take_post_feed().unwrap();
        assert!(session.take_post_feed().is_none());
        session
            .router()
            .dispatch(&ServerFrame::NewPost(json!({ "_id": "p1" })));
        assert_eq!(feed.recv().await.unwrap()["_id"], "p1");

        session
            .router()
            .dispatch(&ServerFrame::NewNotification(NotificationSignal::default()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(api.count("notifications"), 2);

        session.shutdown().await;
        assert!(session.connection().is_closed());
        assert_eq!(session.router().handler_count(EventKind::NewMessage), 0);
    }

    #[tokio::test]
    async fn test_reconnect_resyncs_focused_thread() {
        // Push endpoint that drops the first socket once the test says so.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (drop_tx, drop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let first = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = drop_rx.await;
            drop(first);

            let (stream, _) = listener.accept().await.unwrap();
            let mut second = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = futures_util::StreamExt::next(&mut second).await {}
        });

        let config = ClientConfig {
            server_url: format!("http://{addr}"),
            ..offline_config()
        };
        let api = Arc::new(FakeApi::default());
        *api.conversations.lock().unwrap() = vec![summary("u2", 5, 0)];
        api.histories
            .lock()
            .unwrap()
            .insert("u2".to_string(), vec![message("m1", "u2", ME, 1)]);

        let mut session = ClientSession::start_with_api(&config, ME, "t", api.clone())
            .await
            .unwrap();
        let mut state = session.connection().watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == LinkState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        session.reconciler().open_conversation("u2").await.unwrap();
        assert_eq!(api.count("history:u2"), 1);

        // Arrives while the link is down.
        api.histories
            .lock()
            .unwrap()
            .get_mut("u2")
            .unwrap()
            .push(message("m2", "u2", ME, 2));
        drop_tx.send(()).unwrap();

        let resynced = tokio::time::timeout(Duration::from_secs(5), async {
            while api.count("history:u2") < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(resynced.is_ok());
        assert_eq!(session.connection().connect_count(), 2);

        let ids = async {
            loop {
                let ids: Vec<String> = session
                    .reconciler()
                    .thread_snapshot()
                    .messages
                    .into_iter()
                    .map(|m| m.id)
                    .collect();
                if ids.len() == 2 {
                    return ids;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let ids = tokio::time::timeout(Duration::from_secs(5), ids).await.unwrap();
        assert_eq!(ids, vec!["m1", "m2"]);

        session.shutdown().await;
    }
}
