//! Process configuration from the environment

use crate::runtime::{RelaySettings, SweepSettings};
use crate::state_machine::UserId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub token: String,
    pub owner_id: UserId,
    /// Channel users must join before relaying; `None` admits everyone
    pub force_channel: Option<String>,
    pub db_path: PathBuf,
    pub api_base: String,
    pub poll_timeout: Duration,
    pub delivery_timeout: Duration,
    pub broadcast_concurrency: usize,
    pub state_idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl BotConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let token = get("API_TOKEN").ok_or(ConfigError::Missing("API_TOKEN"))?;
        let owner_raw = get("OWNER_USER_ID").ok_or(ConfigError::Missing("OWNER_USER_ID"))?;
        let owner_id = owner_raw.parse::<UserId>().map_err(|e| ConfigError::Invalid {
            name: "OWNER_USER_ID",
            value: owner_raw.clone(),
            reason: format!("{e}"),
        })?;

        let db_path = get("RELAY_DB_PATH").map_or_else(
            || {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(format!("{home}/.relay-bot/relay.db"))
            },
            PathBuf::from,
        );

        let secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            parse_or(get(name), name, default).map(Duration::from_secs)
        };

        let broadcast_concurrency: usize = parse_or(get("RELAY_BROADCAST_CONCURRENCY"), "RELAY_BROADCAST_CONCURRENCY", 8)?;
        if broadcast_concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "RELAY_BROADCAST_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            token,
            owner_id,
            force_channel: get("FORCE_CHANNEL"),
            db_path,
            api_base: get("TELEGRAM_API_BASE").unwrap_or_else(|| "https://api.telegram.org".to_string()),
            poll_timeout: secs("RELAY_POLL_TIMEOUT_SECS", 30)?,
            delivery_timeout: secs("RELAY_DELIVERY_TIMEOUT_SECS", 10)?,
            broadcast_concurrency,
            state_idle_timeout: secs("RELAY_STATE_IDLE_TIMEOUT_SECS", 1800)?,
            sweep_interval: secs("RELAY_SWEEP_INTERVAL_SECS", 300)?,
        })
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            owner_id: self.owner_id,
            delivery_timeout: self.delivery_timeout,
            broadcast_concurrency: self.broadcast_concurrency,
        }
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            interval: self.sweep_interval,
            idle_timeout: self.state_idle_timeout,
        }
    }
}

fn parse_or<T>(raw: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}
