//! Typed configuration from `OMOIDE_SERIAL_*` environment variables.
//!
//! Loads once at startup and fails fast on missing or out-of-range values.
//! The database URL is wrapped in `SecretString` so it never reaches logs.

pub mod secrets;

use std::time::Duration;

use secrecy::SecretString;

use crate::engine::{BackoffConfig, WorkerConfig};
use crate::error::{Error, Result};

const PREFIX: &str = "OMOIDE_SERIAL_";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Only `serve` needs a worker identity.
    pub worker_name: Option<String>,
    pub backoff: BackoffConfig,
    pub lock_ttl: Option<Duration>,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which receives full variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(&format!("{PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let database_url = var("DATABASE_URL").ok_or_else(|| missing("DATABASE_URL"))?;

        let defaults = BackoffConfig::default();
        let backoff = BackoffConfig {
            min_interval: parse_or(&var, "MIN_INTERVAL", defaults.min_interval)?,
            max_interval: parse_or(&var, "MAX_INTERVAL", defaults.max_interval)?,
            warm_up_coefficient: parse_or(
                &var,
                "WARM_UP_COEFFICIENT",
                defaults.warm_up_coefficient,
            )?,
        };
        backoff.validate()?;

        let lock_ttl = match var("LOCK_TTL") {
            None => None,
            Some(raw) => {
                let secs: f64 = parse("LOCK_TTL", &raw)?;
                let ttl = Duration::try_from_secs_f64(secs)
                    .ok()
                    .filter(|ttl| !ttl.is_zero())
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "{PREFIX}LOCK_TTL must be a positive number of seconds, got {raw}"
                        ))
                    })?;
                Some(ttl)
            }
        };

        Ok(Self {
            database_url: SecretString::from(database_url),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            worker_name: var("WORKER_NAME"),
            backoff,
            lock_ttl,
        })
    }

    /// Worker runtime settings. Requires `OMOIDE_SERIAL_WORKER_NAME`.
    pub fn worker(&self) -> Result<WorkerConfig> {
        let name = self
            .worker_name
            .clone()
            .ok_or_else(|| missing("WORKER_NAME"))?;
        Ok(WorkerConfig {
            name,
            backoff: self.backoff,
            lock_ttl: self.lock_ttl,
        })
    }
}

fn missing(name: &str) -> Error {
    Error::Config(format!(
        "required environment variable {PREFIX}{name} is not set"
    ))
}

fn parse(name: &str, raw: &str) -> Result<f64> {
    raw.parse()
        .map_err(|_| Error::Config(format!("{PREFIX}{name} must be a number, got {raw:?}")))
}

fn parse_or(var: &impl Fn(&str) -> Option<String>, name: &str, default: f64) -> Result<f64> {
    match var(name) {
        Some(raw) => parse(name, &raw),
        None => Ok(default),
    }
}
