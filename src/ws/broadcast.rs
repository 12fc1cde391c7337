use axum::extract::ws::Message;

use super::ConnectionRegistry;
use crate::wire::ServerFrame;

fn encode(frame: &ServerFrame) -> Option<Message> {
    match frame.encode() {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::warn!(error = %e, event = frame.kind().as_str(), "Failed to encode push frame");
            None
        }
    }
}

/// Push a frame to every registered session.
pub fn broadcast_to_all(registry: &ConnectionRegistry, frame: &ServerFrame) {
    let Some(msg) = encode(frame) else {
        return;
    };

    for entry in registry.iter() {
        for sender in entry.value().iter() {
            let _ = sender.send(msg.clone());
        }
    }
}

/// Push a frame to a specific user (all their registered sessions).
/// Returns how many sessions accepted it; zero means the user is offline
/// and will pick the change up from the next snapshot fetch.
pub fn send_to_user(registry: &ConnectionRegistry, user_id: &str, frame: &ServerFrame) -> usize {
    let Some(msg) = encode(frame) else {
        return 0;
    };

    let mut delivered = 0;
    if let Some(connections) = registry.get(user_id) {
        for sender in connections.value().iter() {
            if sender.send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
    }
    delivered
}

/// Announce a freshly created post to every registered session as `new-post`.
/// Post storage is owned by the feed service; the payload is forwarded as-is.
pub fn announce_post(registry: &ConnectionRegistry, post: serde_json::Value) {
    broadcast_to_all(registry, &ServerFrame::NewPost(post));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::NotificationSignal;
    use crate::ws::{new_connection_registry, register_connection};
    use tokio::sync::mpsc;

    #[test]
    fn test_send_to_user_reaches_only_that_user() {
        let registry = new_connection_registry();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        register_connection(&registry, "u1", tx1);
        register_connection(&registry, "u2", tx2);

        let frame = ServerFrame::NewNotification(NotificationSignal { id: Some("n1".into()) });
        assert_eq!(send_to_user(&registry, "u1", &frame), 1);
        assert_eq!(send_to_user(&registry, "nobody", &frame), 0);

        match rx1.try_recv() {
            Ok(Message::Text(text)) => {
                assert_eq!(ServerFrame::decode(text.as_str()).unwrap(), frame);
            }
            other => panic!("expected text frame, got {:?}", other),
        }
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_announce_post_reaches_everyone() {
        let registry = new_connection_registry();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        register_connection(&registry, "u1", tx1);
        register_connection(&registry, "u2", tx2);

        announce_post(&registry, serde_json::json!({ "_id": "p1", "caption": "hi" }));
        assert!(matches!(rx1.try_recv(), Ok(Message::Text(_))));
        assert!(matches!(rx2.try_recv(), Ok(Message::Text(_))));
    }
}
