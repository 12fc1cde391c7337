use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use super::error::ClientError;

/// Client delivery settings.
/// Precedence: built-in defaults < TOML file < env vars (KINSHIP_CLIENT_*).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// REST base URL; the push URL is derived from it (default: http://localhost:5000)
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Seconds between client heartbeat pings (default: 25)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Unanswered pings tolerated before the link is declared dead (default: 2)
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,

    /// First reconnect delay in milliseconds, doubled per attempt (default: 500)
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds (default: 30000)
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Seconds between reconciliation polls; 0 disables polling (default: 60)
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Attempts for idempotent GET requests (default: 3)
    #[serde(default = "default_request_attempts")]
    pub request_attempts: u32,
}

fn default_server_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_heartbeat_interval() -> u64 {
    25
}

fn default_max_missed_pongs() -> u32 {
    2
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_request_attempts() -> u32 {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_missed_pongs: default_max_missed_pongs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconcile_interval_secs: default_reconcile_interval(),
            request_attempts: default_request_attempts(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(ClientConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("KINSHIP_CLIENT_"))
            .extract()
    }

    /// REST base URL without a trailing slash.
    pub fn rest_base(&self) -> String {
        self.server_url.trim_end_matches('/').to_string()
    }

    /// Push channel URL for `token`: http(s) becomes ws(s), path `/ws`.
    pub fn push_url(&self, token: &str) -> Result<String, ClientError> {
        let base = self.rest_base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base
        } else {
            return Err(ClientError::InvalidUrl(self.server_url.clone()));
        };
        Ok(format!("{ws_base}/ws?token={token}"))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms).max(1))
    }

    /// `None` when polling is disabled.
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }
}
