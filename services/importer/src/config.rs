//! Importer configuration loading.
//!
//! Two sources, selected on the command line: a config file (`-f <path>`), or
//! environment variables when no file is given.  Both go through the same
//! validation and produce an [`ImporterConfig`].
//!
//! Files ending in `.yaml` or `.yml` are read as YAML, the layout earlier
//! k8see deployments use; any other file is read as TOML.  Both formats use
//! the same flat keys.
//!
//! # Required fields
//! - `dbhost`, `dbport`, `dbuser`, `dbpassword`, `dbname`
//! - `redis_host`, `redis_port`, `redis_stream`
//!
//! # Environment variables
//! `DBHOST DBPORT DBUSER DBPASSWORD DBNAME REDIS_HOST REDIS_PORT
//! REDIS_PASSWORD REDIS_STREAM LOGLEVEL DATA_RETENTION_IN_DAYS`
//!
//! Ports may be written as integers or strings.  A retention that is
//! missing, non-numeric, below one day or above [`MAX_RETENTION_DAYS`] falls
//! back to 30 days.

use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::path::Path;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
/// Longest accepted retention, about a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Validated importer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImporterConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    /// `debug`, `info`, `warn` or `error`; anything else means `debug`.
    pub log_level: Option<String>,
    pub retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub stream: String,
}

impl ImporterConfig {
    /// Default `tracing` filter directive for the configured level.
    pub fn tracing_directive(&self) -> &'static str {
        match self.log_level.as_deref() {
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.name)
            .ssl_mode(PgSslMode::Disable)
    }
}

impl RedisConfig {
    /// `redis://[:password@]host:port/`, password percent-encoded.
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.password.as_deref() {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{}@{}:{}/", urlencoding::encode(pw), host, self.port)
            }
            _ => format!("redis://{}:{}/", host, self.port),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw deserialization types (everything optional)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    dbhost: Option<String>,
    dbport: Option<RawScalar>,
    dbuser: Option<String>,
    dbpassword: Option<String>,
    dbname: Option<String>,
    loglevel: Option<String>,
    redis_host: Option<String>,
    redis_port: Option<RawScalar>,
    redis_password: Option<String>,
    redis_stream: Option<String>,
    data_retention_in_days: Option<RawScalar>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Int(i64),
    Text(String),
}

impl RawScalar {
    fn as_i64(&self) -> Option<i64> {
        match self {
            RawScalar::Int(n) => Some(*n),
            RawScalar::Text(s) => s.trim().parse().ok(),
        }
    }

    fn describe(&self) -> String {
        match self {
            RawScalar::Int(n) => n.to_string(),
            RawScalar::Text(s) => format!("{s:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load importer config from a YAML or TOML file, chosen by extension.
pub fn load_config_from_path(path: &Path) -> Result<ImporterConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => load_config_from_yaml_str(&text),
        _ => load_config_from_str(&text),
    }
}

/// Load importer config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ImporterConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(raw)
}

/// Load importer config from a YAML string.
pub fn load_config_from_yaml_str(yaml: &str) -> Result<ImporterConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(raw)
}

/// Load importer config from the process environment.
pub fn load_config_from_env() -> Result<ImporterConfig, ConfigError> {
    load_config_from_lookup(|key| std::env::var(key).ok())
}

/// Load importer config from environment-style variables supplied by `lookup`.
pub fn load_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ImporterConfig, ConfigError> {
    let scalar = |key: &str| lookup(key).map(RawScalar::Text);
    let raw = RawConfig {
        dbhost: lookup("DBHOST"),
        dbport: scalar("DBPORT"),
        dbuser: lookup("DBUSER"),
        dbpassword: lookup("DBPASSWORD"),
        dbname: lookup("DBNAME"),
        loglevel: lookup("LOGLEVEL"),
        redis_host: lookup("REDIS_HOST"),
        redis_port: scalar("REDIS_PORT"),
        redis_password: lookup("REDIS_PASSWORD"),
        redis_stream: lookup("REDIS_STREAM"),
        data_retention_in_days: scalar("DATA_RETENTION_IN_DAYS"),
    };
    validate(raw)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(raw: RawConfig) -> Result<ImporterConfig, ConfigError> {
    let database = DatabaseConfig {
        host: required(raw.dbhost, "dbhost")?,
        port: port(raw.dbport, "dbport")?,
        user: required(raw.dbuser, "dbuser")?,
        password: required(raw.dbpassword, "dbpassword")?,
        name: required(raw.dbname, "dbname")?,
    };

    let redis = RedisConfig {
        host: required(raw.redis_host, "redis_host")?,
        port: port(raw.redis_port, "redis_port")?,
        password: raw.redis_password.filter(|p| !p.is_empty()),
        stream: required(raw.redis_stream, "redis_stream")?,
    };

    let retention_days = raw
        .data_retention_in_days
        .as_ref()
        .and_then(RawScalar::as_i64)
        .and_then(|days| u32::try_from(days).ok())
        .filter(|days| (1..=MAX_RETENTION_DAYS).contains(days))
        .unwrap_or(DEFAULT_RETENTION_DAYS);

    Ok(ImporterConfig {
        database,
        redis,
        log_level: raw.loglevel.filter(|l| !l.is_empty()),
        retention_days,
    })
}

fn required(value: Option<String>, field: &str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingField(field.to_owned()))
}

fn port(value: Option<RawScalar>, field: &str) -> Result<u16, ConfigError> {
    let raw = value.ok_or_else(|| ConfigError::MissingField(field.to_owned()))?;
    raw.as_i64()
        .and_then(|n| u16::try_from(n).ok())
        .filter(|n| *n >= 1)
        .ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "{} must be a port number between 1 and 65535, got {}",
                field,
                raw.describe()
            ))
        })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
