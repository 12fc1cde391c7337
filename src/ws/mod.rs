pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Connection registry: registered push sessions per user id.
/// A session lands here only after its `register` frame has been accepted.
/// Arc<DashMap<UserId, Vec<ConnectionSender>>>
pub type ConnectionRegistry = Arc<DashMap<String, Vec<ConnectionSender>>>;

/// Create a new empty connection registry.
pub fn new_connection_registry() -> ConnectionRegistry {
    Arc::new(DashMap::new())
}

/// Add a connection sender under `user_id`.
pub fn register_connection(registry: &ConnectionRegistry, user_id: &str, tx: ConnectionSender) {
    let mut entry = registry.entry(user_id.to_string()).or_default();
    entry.retain(|sender| !sender.is_closed());
    entry.push(tx);
    let conn_count = entry.len();
    drop(entry);

    tracing::debug!(
        user_id = %user_id,
        connections = conn_count,
        "Connection registered"
    );
}

/// Remove `tx` (and any closed senders) for a user; drops the user entry when empty.
pub fn unregister_connection(registry: &ConnectionRegistry, user_id: &str, tx: &ConnectionSender) {
    let mut remove_user = false;

    if let Some(mut connections) = registry.get_mut(user_id) {
        connections.retain(|sender| !sender.is_closed() && !sender.same_channel(tx));
        if connections.is_empty() {
            remove_user = true;
        }
    }

    if remove_user {
        registry.remove_if(user_id, |_, senders| senders.is_empty());
    }

    tracing::debug!(
        user_id = %user_id,
        "Connection unregistered"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let registry = new_connection_registry();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        register_connection(&registry, "u1", tx_a.clone());
        register_connection(&registry, "u1", tx_b.clone());
        assert_eq!(registry.get("u1").map(|v| v.len()), Some(2));

        unregister_connection(&registry, "u1", &tx_a);
        assert_eq!(registry.get("u1").map(|v| v.len()), Some(1));

        unregister_connection(&registry, "u1", &tx_b);
        assert!(registry.get("u1").is_none());
    }

    #[test]
    fn test_register_prunes_closed_senders() {
        let registry = new_connection_registry();
        let (stale, stale_rx) = mpsc::unbounded_channel();
        register_connection(&registry, "u1", stale);
        drop(stale_rx);

        let (live, _live_rx) = mpsc::unbounded_channel();
        register_connection(&registry, "u1", live);
        assert_eq!(registry.get("u1").map(|v| v.len()), Some(1));
    }
}
