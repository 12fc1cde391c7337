use std::time::Duration;

use crate::config::RealtimeConfig;
use crate::db::DbPool;
use crate::ws::ConnectionRegistry;

/// Keepalive timings for server-side WebSocket actors.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl From<RealtimeConfig> for Keepalive {
    fn from(config: RealtimeConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(config.pong_timeout_secs.max(1)),
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        RealtimeConfig::default().into()
    }
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT verification secret (256-bit, shared with the account service)
    pub jwt_secret: Vec<u8>,
    /// Registered push sessions per user
    pub connections: ConnectionRegistry,
    /// Ping/pong timings for WebSocket actors
    pub keepalive: Keepalive,
}
