//! Configuration types.
//!
//! Everything is read from the environment (a `.env` file is loaded first by
//! the binary). Required variables fail fast; optional ones fall back to the
//! defaults the pipeline modules export.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::{
    ControllerConfig, DeliveryStrategy, DispatcherConfig, RunMode, aggregator, controller,
};
use crate::rewrite::DEFAULT_REWRITE_TIMEOUT;
use crate::store::DEFAULT_STATE_FILE;

/// Default pacing between consecutive destination sends in poll mode. Listen
/// mode sends as posts arrive.
pub const DEFAULT_POLL_SEND_INTERVAL: Duration = Duration::from_millis(500);

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Monitored source channels (`@username` or numeric id).
    pub source_channels: Vec<String>,
    /// Destination channel.
    pub target_channel: String,
    pub bot_token: SecretString,
    /// Rewrite endpoint. `None` disables rewriting.
    pub rewrite_url: Option<String>,
    pub rewrite_timeout: Duration,
    pub state_file: PathBuf,
    pub mode: RunMode,
    pub max_run: Duration,
    pub debounce: Duration,
    pub poll_limit: usize,
    pub send_interval: Duration,
    pub strategy: DeliveryStrategy,
    /// Directory for a daily-rolling log file, in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));

        let source_channels = split_list(&require("SOURCE_CHANNELS")?);
        if source_channels.is_empty() {
            return Err(ConfigError::MissingEnvVar("SOURCE_CHANNELS".into()));
        }
        let target_channel = require("TARGET_CHANNEL")?;
        let bot_token = SecretString::from(require("TELEGRAM_BOT_TOKEN")?);

        let mode = match get("RELAY_MODE").as_deref() {
            None | Some("listen") => RunMode::Listen,
            Some("poll") => RunMode::Poll,
            Some(other) => {
                return Err(invalid(
                    "RELAY_MODE",
                    format!("expected listen or poll, got {other:?}"),
                ));
            }
        };

        let strategy = match get("RELAY_STRATEGY").as_deref() {
            None | Some("rebuild") => DeliveryStrategy::Rebuild,
            Some("copy_and_edit") => DeliveryStrategy::CopyAndEdit,
            Some(other) => {
                return Err(invalid(
                    "RELAY_STRATEGY",
                    format!("expected rebuild or copy_and_edit, got {other:?}"),
                ));
            }
        };

        let secs = |key: &str, default: Duration| {
            parse_or(get(key), key, default.as_secs()).map(Duration::from_secs)
        };
        let millis = |key: &str, default: Duration| {
            parse_or(get(key), key, default.as_millis() as u64).map(Duration::from_millis)
        };

        Ok(Self {
            source_channels,
            target_channel,
            bot_token,
            rewrite_url: get("FLOWISE_URL"),
            rewrite_timeout: secs("RELAY_REWRITE_TIMEOUT_SECS", DEFAULT_REWRITE_TIMEOUT)?,
            state_file: get("RELAY_STATE_FILE")
                .unwrap_or_else(|| DEFAULT_STATE_FILE.to_string())
                .into(),
            mode,
            max_run: secs("RELAY_MAX_RUN_SECS", controller::DEFAULT_MAX_RUN)?,
            debounce: millis("RELAY_DEBOUNCE_MS", aggregator::DEFAULT_DEBOUNCE)?,
            poll_limit: parse_or(
                get("RELAY_POLL_LIMIT"),
                "RELAY_POLL_LIMIT",
                controller::DEFAULT_POLL_LIMIT,
            )?,
            send_interval: millis(
                "RELAY_SEND_INTERVAL_MS",
                match mode {
                    RunMode::Poll => DEFAULT_POLL_SEND_INTERVAL,
                    RunMode::Listen => Duration::ZERO,
                },
            )?,
            strategy,
            log_dir: get("RELAY_LOG_DIR").map(PathBuf::from),
        })
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            mode: self.mode,
            max_run: self.max_run,
            debounce: self.debounce,
            poll_limit: self.poll_limit,
            ..ControllerConfig::new(self.source_channels.clone())
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            strategy: self.strategy,
            send_interval: self.send_interval,
            ..DispatcherConfig::new(self.target_channel.clone())
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| invalid(key, format!("{raw:?}: {e}"))),
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    }
}
