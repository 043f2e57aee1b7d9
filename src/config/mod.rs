//! Configuration loading and management.
//!
//! TOML configuration with serde defaults, loaded once at startup and
//! validated as a whole so operators see every problem in one pass.

mod defaults;

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use self::defaults::{
    default_function_timeout_secs, default_listen, default_max_connections_per_user,
    default_max_message_size, default_message_timeout_secs, default_rate_limit,
    default_server_name, default_true, default_ws_path,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable terminal output.
    #[default]
    Pretty,
    /// Structured JSON lines.
    Json,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server identity and listener.
    #[serde(default)]
    pub server: ServerConfig,
    /// Broker behavior knobs.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Static token table for the built-in auth provider.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// Server identity and listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Instance name, used in logs only.
    #[serde(default = "default_server_name")]
    pub name: String,
    /// TCP listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            listen: default_listen(),
            log_format: LogFormat::default(),
        }
    }
}

/// Broker behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// WebSocket upgrade path.
    #[serde(default = "default_ws_path")]
    pub path: String,
    /// Reject connections whose token the provider does not recognize.
    #[serde(default = "default_true")]
    pub require_auth: bool,
    /// Admit empty tokens as guest principals.
    #[serde(default)]
    pub allow_anonymous: bool,
    /// Create rooms on first join.
    #[serde(default = "default_true")]
    pub auto_create_rooms: bool,
    /// Persist a room snapshot after every applied operation.
    #[serde(default)]
    pub save_on_operation: bool,
    /// Token-bucket rate: messages per second per connection.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: f32,
    /// Maximum wire message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Idle seconds before the broker pings a quiet connection.
    #[serde(default = "default_message_timeout_secs")]
    pub message_timeout_secs: u64,
    /// Hard cap on function handler runtime, seconds.
    #[serde(default = "default_function_timeout_secs")]
    pub function_timeout_secs: u64,
    /// Concurrent connections allowed per user id.
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    /// Rewrite operation timestamps with the broker's monotonic clock.
    #[serde(default)]
    pub use_server_timestamp: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            require_auth: true,
            allow_anonymous: false,
            auto_create_rooms: true,
            save_on_operation: false,
            rate_limit: default_rate_limit(),
            max_message_size: default_max_message_size(),
            message_timeout_secs: default_message_timeout_secs(),
            function_timeout_secs: default_function_timeout_secs(),
            max_connections_per_user: default_max_connections_per_user(),
            use_server_timestamp: false,
        }
    }
}

impl BrokerConfig {
    /// Idle-ping interval as a [`Duration`].
    #[must_use]
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    /// Function handler cap as a [`Duration`].
    #[must_use]
    pub fn function_timeout(&self) -> Duration {
        Duration::from_secs(self.function_timeout_secs)
    }
}

/// One static auth token mapped to a principal.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    /// The opaque token presented by clients.
    pub token: String,
    /// Stable user id to assign.
    pub user_id: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Roles to grant.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {path}: {e}"))?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| anyhow::anyhow!("cannot parse {path}: {e}"))?;
        Ok(config)
    }
}

/// Validate a configuration, collecting every problem.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if !config.broker.path.starts_with('/') {
        errors.push(format!("broker.path must start with '/': {:?}", config.broker.path));
    }
    if config.broker.rate_limit <= 0.0 {
        errors.push(format!("broker.rate_limit must be positive: {}", config.broker.rate_limit));
    }
    if config.broker.max_message_size == 0 {
        errors.push("broker.max_message_size must be non-zero".to_string());
    }
    if config.broker.max_message_size > collab_proto::MAX_MESSAGE_SIZE {
        errors.push(format!(
            "broker.max_message_size exceeds protocol cap of {} bytes",
            collab_proto::MAX_MESSAGE_SIZE
        ));
    }
    if config.broker.function_timeout_secs == 0 {
        errors.push("broker.function_timeout_secs must be non-zero".to_string());
    }
    if config.broker.max_connections_per_user == 0 {
        errors.push("broker.max_connections_per_user must be non-zero".to_string());
    }
    if config.broker.require_auth && !config.broker.allow_anonymous && config.tokens.is_empty() {
        errors.push(
            "require_auth is set but no [[tokens]] are configured and anonymous \
             access is disabled; nobody will be able to connect"
                .to_string(),
        );
    }
    let mut seen = std::collections::HashSet::new();
    for entry in &config.tokens {
        if entry.token.is_empty() {
            errors.push(format!("empty token for user {:?}", entry.user_id));
        }
        if !seen.insert(entry.token.as_str()) {
            errors.push(format!("duplicate token for user {:?}", entry.user_id));
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
