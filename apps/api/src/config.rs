//! API server configuration

use std::env;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use lockstep_shared_config::{
    parse_env, BrokerConfig, CommonConfig, DatabaseConfig, Environment,
};

/// Minimum required length for JWT_SECRET to be considered secure
const MIN_JWT_SECRET_LENGTH: usize = 32;

/// API server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Server port (default: 8080)
    pub port: u16,

    /// JWT secret for operator tokens
    pub jwt_secret: String,

    /// CORS allowed origins (optional)
    pub cors_allowed_origins: Option<Vec<String>>,

    /// Presence, pairing and sync tuning
    pub policy: Policy,
}

/// Timeouts and thresholds for the coordination services
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub heartbeat_timeout_secs: u64,
    pub presence_sweep_interval_secs: u64,
    pub pairing_bundle_ttl_secs: u64,
    pub pairing_code_ttl_secs: u64,
    pub pairing_sweep_interval_secs: u64,
    pub sync_drift_threshold_ms: i64,
    pub sync_max_clock_skew_ms: i64,
    pub sync_min_ok_rate: f64,
    /// Per-device command queue bound; oldest entries are dropped past it
    pub command_queue_capacity: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
            presence_sweep_interval_secs: 5,
            pairing_bundle_ttl_secs: 120,
            pairing_code_ttl_secs: 300,
            pairing_sweep_interval_secs: 60,
            sync_drift_threshold_ms: 80,
            sync_max_clock_skew_ms: 5_000,
            sync_min_ok_rate: 0.9,
            command_queue_capacity: 64,
        }
    }
}

impl Policy {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let policy = Self {
            heartbeat_timeout_secs: parse_env(
                "HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout_secs,
            )?,
            presence_sweep_interval_secs: parse_env(
                "PRESENCE_SWEEP_INTERVAL_SECS",
                defaults.presence_sweep_interval_secs,
            )?,
            pairing_bundle_ttl_secs: parse_env(
                "PAIRING_BUNDLE_TTL_SECS",
                defaults.pairing_bundle_ttl_secs,
            )?,
            pairing_code_ttl_secs: parse_env("PAIRING_CODE_TTL_SECS", defaults.pairing_code_ttl_secs)?,
            pairing_sweep_interval_secs: parse_env(
                "PAIRING_SWEEP_INTERVAL_SECS",
                defaults.pairing_sweep_interval_secs,
            )?,
            sync_drift_threshold_ms: parse_env(
                "SYNC_DRIFT_THRESHOLD_MS",
                defaults.sync_drift_threshold_ms,
            )?,
            sync_max_clock_skew_ms: parse_env(
                "SYNC_MAX_CLOCK_SKEW_MS",
                defaults.sync_max_clock_skew_ms,
            )?,
            sync_min_ok_rate: parse_env("SYNC_MIN_OK_RATE", defaults.sync_min_ok_rate)?,
            command_queue_capacity: parse_env(
                "COMMAND_QUEUE_CAPACITY",
                defaults.command_queue_capacity,
            )?,
        };
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout_secs == 0 {
            bail!("HEARTBEAT_TIMEOUT_SECS must be greater than zero");
        }
        if self.presence_sweep_interval_secs == 0 || self.pairing_sweep_interval_secs == 0 {
            bail!("sweep intervals must be greater than zero");
        }
        if self.pairing_bundle_ttl_secs == 0 || self.pairing_code_ttl_secs == 0 {
            bail!("pairing TTLs must be greater than zero");
        }
        if self.sync_drift_threshold_ms <= 0 {
            bail!("SYNC_DRIFT_THRESHOLD_MS must be positive");
        }
        if !(0.0..=1.0).contains(&self.sync_min_ok_rate) {
            bail!("SYNC_MIN_OK_RATE must be within 0.0..=1.0");
        }
        if self.command_queue_capacity == 0 {
            bail!("COMMAND_QUEUE_CAPACITY must be greater than zero");
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn presence_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.presence_sweep_interval_secs)
    }

    pub fn pairing_bundle_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pairing_bundle_ttl_secs as i64)
    }

    pub fn pairing_code_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pairing_code_ttl_secs as i64)
    }

    pub fn pairing_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pairing_sweep_interval_secs)
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// In production mode, this function requires:
    /// - `JWT_SECRET`: Must be set and at least 32 characters long
    /// - `DATABASE_URL`: Must be explicitly set (no insecure defaults)
    ///
    /// In development mode, sensible defaults are used for convenience.
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_str(
            &env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        )
        .unwrap_or_default();
        let is_production = environment.is_production();

        let jwt_secret = Self::load_jwt_secret(is_production)?;

        if is_production {
            Self::validate_database_url()?;
        }

        let common = CommonConfig::from_env().context("Failed to load common config")?;

        Ok(Self {
            common,

            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid PORT value")?,

            jwt_secret,

            cors_allowed_origins: env::var("CORS_ORIGINS").ok().map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),

            policy: Policy::from_env()?,
        })
    }

    /// Configuration for tests: in-memory store, default policy
    pub fn for_tests() -> Self {
        Self {
            common: CommonConfig::for_tests(),
            port: 0,
            jwt_secret: "test-secret-that-is-long-enough-for-hs256".to_string(),
            cors_allowed_origins: None,
            policy: Policy::default(),
        }
    }

    /// Load and validate JWT_SECRET
    ///
    /// In production:
    /// - JWT_SECRET must be explicitly set
    /// - Must be at least MIN_JWT_SECRET_LENGTH characters
    ///
    /// In development: uses a default value with a warning
    fn load_jwt_secret(is_production: bool) -> Result<String> {
        match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => {
                if is_production && secret.len() < MIN_JWT_SECRET_LENGTH {
                    bail!(
                        "JWT_SECRET must be at least {} characters in production (got {})",
                        MIN_JWT_SECRET_LENGTH,
                        secret.len()
                    );
                }
                Ok(secret)
            }
            _ if is_production => {
                bail!(
                    "JWT_SECRET environment variable is required in production. \
                     Please set a secure secret of at least {} characters.",
                    MIN_JWT_SECRET_LENGTH
                );
            }
            _ => {
                tracing::warn!(
                    "JWT_SECRET not set, using insecure default. \
                     This is only acceptable in development mode."
                );
                Ok("development-secret-change-in-production".to_string())
            }
        }
    }

    /// Validate that DATABASE_URL is explicitly set in production
    fn validate_database_url() -> Result<()> {
        match env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => Ok(()),
            _ => {
                bail!(
                    "DATABASE_URL environment variable is required in production. \
                     Please set your PostgreSQL connection string."
                );
            }
        }
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.common.database
    }

    pub fn broker(&self) -> &BrokerConfig {
        &self.common.broker
    }

    pub fn environment(&self) -> Environment {
        self.common.environment
    }

    pub fn is_production(&self) -> bool {
        self.common.environment.is_production()
    }
}
