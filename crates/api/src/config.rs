//! Server configuration loaded from environment variables

use std::env;
use std::str::FromStr;

use apihub_shared::DEFAULT_MAX_CONNECTIONS;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
pub const DEFAULT_TESTER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TESTER_MAX_RESPONSE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_address: String,
    /// HS256 secret shared with the auth provider
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub enable_billing: bool,
    /// Empty means any origin
    pub allowed_origins: Vec<String>,
    pub tester_timeout_secs: u64,
    pub tester_max_response_bytes: usize,
    /// Let the tester reach loopback and private networks (local development)
    pub tester_allow_private_targets: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            bind_address: optional("BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            jwt_secret: required("AUTH_JWT_SECRET")?,
            jwt_issuer: optional("AUTH_JWT_ISSUER"),
            jwt_audience: optional("AUTH_JWT_AUDIENCE"),
            enable_billing: flag("ENABLE_BILLING", true)?,
            allowed_origins: optional("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            tester_timeout_secs: parsed("TESTER_TIMEOUT_SECS", DEFAULT_TESTER_TIMEOUT_SECS)?,
            tester_max_response_bytes: parsed(
                "TESTER_MAX_RESPONSE_BYTES",
                DEFAULT_TESTER_MAX_RESPONSE_BYTES,
            )?,
            tester_allow_private_targets: flag("TESTER_ALLOW_PRIVATE_TARGETS", false)?,
        })
    }
}

/// Set and non-blank
fn optional(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

fn flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(name) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value }),
        },
        None => Ok(default),
    }
}
