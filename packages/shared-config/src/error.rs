//! Errors raised while reading Lockstep settings from the environment

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting the service cannot start without is unset
    #[error("{0} is not set")]
    MissingEnvVar(String),

    /// A setting is present but does not parse
    #[error("{0} has an invalid value: {1}")]
    InvalidValue(String, String),

    /// The broker or store URL names a scheme no client here speaks;
    /// only the scheme is echoed since the URL may carry credentials
    #[error("{var} must use one of {expected:?}, got '{scheme}'")]
    UnsupportedScheme {
        var: String,
        scheme: String,
        expected: &'static [&'static str],
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
