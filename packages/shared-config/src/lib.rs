//! Shared configuration types for Lockstep services
//!
//! This crate provides the configuration pieces every Lockstep process needs
//! (store, broker, environment mode), loaded from environment variables.

mod broker;
mod database;
mod error;

pub use broker::BrokerConfig;
pub use database::{DatabaseConfig, StoreBackend};
pub use error::{ConfigError, ConfigResult};

use std::env;

/// Common configuration shared between all services
#[derive(Debug, Clone)]
pub struct CommonConfig {
    /// Durable store configuration
    pub database: DatabaseConfig,

    /// Pub/sub broker configuration
    pub broker: BrokerConfig,

    /// Environment mode (development, staging, production)
    pub environment: Environment,

    /// Log level (from RUST_LOG or LOG_LEVEL)
    pub log_level: String,
}

/// Application environment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        })
    }
}

impl Environment {
    /// Check if this is a production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Check if this is a development environment
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl CommonConfig {
    /// Load common configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            broker: BrokerConfig::from_env()?,
            environment: env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string())
                .parse()
                .unwrap_or_default(),
            log_level: env::var("RUST_LOG")
                .or_else(|_| env::var("LOG_LEVEL"))
                .unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Configuration for tests: in-memory store, default broker URL
    pub fn for_tests() -> Self {
        Self {
            database: DatabaseConfig::in_memory(),
            broker: BrokerConfig::default(),
            environment: Environment::Development,
            log_level: "debug".to_string(),
        }
    }
}

/// Helper function to get a required environment variable
pub fn get_required_env(name: &str) -> ConfigResult<String> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

/// Helper function to get an optional environment variable with a default
pub fn get_env_or_default(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reject a connection URL whose scheme is not one of `expected`
pub fn require_scheme(var: &str, url: &str, expected: &'static [&'static str]) -> ConfigResult<()> {
    let scheme = url.split_once("://").map_or("", |(scheme, _)| scheme);
    if expected.iter().any(|allowed| allowed.eq_ignore_ascii_case(scheme)) {
        return Ok(());
    }
    Err(ConfigError::UnsupportedScheme {
        var: var.to_string(),
        scheme: scheme.to_string(),
        expected,
    })
}

/// Helper function to parse an environment variable into a specific type
pub fn parse_env<T>(name: &str, default: T) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!(
            "prod".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!(
            "stage".parse::<Environment>().unwrap(),
            Environment::Staging
        );
        assert_eq!(
            "anything".parse::<Environment>().unwrap(),
            Environment::Development
        );
    }

    #[test]
    fn test_environment_checks() {
        assert!(Environment::Production.is_production());
        assert!(!Environment::Production.is_development());
        assert!(Environment::Development.is_development());
    }

    #[test]
    fn test_parse_env_invalid_value() {
        std::env::set_var("LOCKSTEP_TEST_PARSE_ENV", "not-a-number");
        let result: ConfigResult<u64> = parse_env("LOCKSTEP_TEST_PARSE_ENV", 5);
        std::env::remove_var("LOCKSTEP_TEST_PARSE_ENV");
        assert!(matches!(result, Err(ConfigError::InvalidValue(_, _))));
    }

    #[test]
    fn test_require_scheme() {
        assert!(require_scheme("REDIS_URL", "rediss://cache:6380", &["redis", "rediss"]).is_ok());

        let err = require_scheme(
            "DATABASE_URL",
            "mysql://root:secret@db/lockstep",
            &["postgres", "postgresql"],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedScheme {
                var: "DATABASE_URL".to_string(),
                scheme: "mysql".to_string(),
                expected: &["postgres", "postgresql"],
            }
        );
        assert!(!err.to_string().contains("secret"));

        assert!(require_scheme("REDIS_URL", "localhost:6379", &["redis"]).is_err());
    }

    #[test]
    fn test_for_tests_uses_memory_store() {
        let config = CommonConfig::for_tests();
        assert!(!config.database.uses_postgres());
    }
}
