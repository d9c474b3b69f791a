//! Pub/sub broker configuration types

use crate::{get_env_or_default, parse_env, require_scheme, ConfigResult};

const BROKER_SCHEMES: &[&str] = &["redis", "rediss"];

/// Redis pub/sub broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redis connection URL
    pub url: String,

    /// Optional password for Redis authentication
    pub password: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Upper bound for the listener's reconnect backoff
    pub max_reconnect_delay_secs: u64,

    /// Consecutive listener failures tolerated before giving up
    pub max_reconnect_attempts: u32,
}

impl BrokerConfig {
    /// Load broker configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let url = get_env_or_default("REDIS_URL", "redis://localhost:6379");
        require_scheme("REDIS_URL", &url, BROKER_SCHEMES)?;
        Ok(Self {
            url,
            password: std::env::var("REDIS_PASSWORD").ok().filter(|s| !s.is_empty()),
            connect_timeout_secs: parse_env("REDIS_CONNECT_TIMEOUT", 5)?,
            max_reconnect_delay_secs: parse_env("BROKER_MAX_RECONNECT_DELAY", 60)?,
            max_reconnect_attempts: parse_env("BROKER_MAX_RECONNECT_ATTEMPTS", 100)?,
        })
    }

    /// Create a configuration with a custom URL (useful for testing)
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Build the full connection URL including password if set
    pub fn connection_url(&self) -> String {
        if let Some(ref password) = self.password {
            if let Some(at_pos) = self.url.find("://") {
                let (scheme, rest) = self.url.split_at(at_pos + 3);
                return format!("{}:{}@{}", scheme, password, rest);
            }
        }
        self.url.clone()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            password: None,
            connect_timeout_secs: 5,
            max_reconnect_delay_secs: 60,
            max_reconnect_attempts: 100,
        }
    }
}
