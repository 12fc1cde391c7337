use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Kinship realtime delivery server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "kinship-relay", version, about = "Kinship realtime delivery server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "KINSHIP_PORT", default_value = "5000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "KINSHIP_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./kinship.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "KINSHIP_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, signing key)
    #[arg(long, env = "KINSHIP_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Push channel keepalive settings (loaded from [realtime] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeConfig>,
}

/// Keepalive for server-side WebSocket connections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Seconds between server pings (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before closing the socket (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
        }
    }
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            bind_address: "0.0.0.0".to_string(),
            config: "./kinship.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            realtime: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (KINSHIP_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("KINSHIP_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Kinship Relay Configuration
# Place this file at ./kinship.toml or specify with --config <path>
# All settings can be overridden via environment variables (KINSHIP_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 5000)
# port = 5000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and JWT signing key
# data_dir = "./data"

# ---- Push channel keepalive ----
# [realtime]

# Seconds between server pings on each WebSocket (default: 30)
# ping_interval_secs = 30

# Seconds to wait for the matching pong before the socket is closed (default: 10)
# pong_timeout_secs = 10
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_section_defaults_when_missing() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("port = 6001\n"))
            .extract()
            .unwrap();
        assert_eq!(config.port, 6001);
        assert_eq!(config.realtime.unwrap_or_default(), RealtimeConfig::default());
    }

    #[test]
    fn test_realtime_section_from_toml() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("[realtime]\nping_interval_secs = 5\n"))
            .extract()
            .unwrap();
        let realtime = config.realtime.expect("realtime section");
        assert_eq!(realtime.ping_interval_secs, 5);
        assert_eq!(realtime.pong_timeout_secs, 10);
    }

    #[test]
    fn test_template_mentions_every_section() {
        let template = generate_config_template();
        assert!(template.contains("[realtime]"));
        assert!(template.contains("data_dir"));
    }
}
