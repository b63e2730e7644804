use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl AmqpSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub bind_host: String,
    pub bind_port: u16,
    pub pool_max_size: u32,
    pub connection_timeout: Duration,
    pub retry_attempts: u32,
    pub sweep_interval: Duration,
    pub amqp: AmqpSettings,
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let storage = match lookup("STORAGE_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("postgres") => StorageBackend::Postgres,
            Some("memory") => StorageBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                    reason: "expected 'postgres' or 'memory'".to_string(),
                })
            }
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if storage == StorageBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let amqp_defaults = AmqpSettings::disabled();
        let amqp = AmqpSettings {
            enabled: parse_bool(&lookup, "AMQP_ENABLED", false)?,
            host: lookup("AMQP_HOST").unwrap_or(amqp_defaults.host),
            port: parse(&lookup, "AMQP_PORT", amqp_defaults.port)?,
            user: lookup("AMQP_USER").unwrap_or(amqp_defaults.user),
            password: lookup("AMQP_PASSWORD").unwrap_or(amqp_defaults.password),
        };

        Ok(Self {
            storage,
            database_url,
            bind_host: lookup("BIND_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            bind_port: parse(&lookup, "BIND_PORT", 8080)?,
            pool_max_size: parse_positive(&lookup, "DB_POOL_MAX_SIZE", 10u32)?,
            connection_timeout: Duration::from_secs(parse_positive(&lookup, "DB_CONNECTION_TIMEOUT_SECS", 5)?),
            retry_attempts: parse_positive(&lookup, "TRANSIENT_RETRY_ATTEMPTS", 3u32)?,
            sweep_interval: Duration::from_secs(parse_positive(&lookup, "SESSION_SWEEP_INTERVAL_SECS", 60)?),
            amqp,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: value.clone(),
            reason: e.to_string(),
        }),
    }
}

// Pool sizes, timeouts and tick intervals panic downstream when zero.
fn parse_positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Default + PartialEq + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let value = parse(lookup, key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
