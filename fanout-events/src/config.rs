//! Event bus configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env::{self, VarError};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

/// Default environment prefix read by [`EventBusConfig::from_env`].
pub const ENV_PREFIX: &str = "FANOUT_BUS";

/// What happens to an event no subscription matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadEventPolicy {
    /// Complete the publish successfully.
    #[default]
    Ignore,

    /// Log a warning, then complete successfully. The warning is emitted
    /// even when `enable_logging` is off.
    Log,

    /// Publish a [`DeadEvent`](crate::DeadEvent) wrapping it.
    Republish,
}

impl FromStr for DeadEventPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "log" => Ok(Self::Log),
            "republish" => Ok(Self::Republish),
            _ => Err(ConfigError::Invalid {
                key: "dead_events".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for DeadEventPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ignore => "ignore",
            Self::Log => "log",
            Self::Republish => "republish",
        })
    }
}

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Worker threads (None = available parallelism, capped)
    pub worker_threads: Option<usize>,

    /// Cap applied when `worker_threads` is unset
    pub max_worker_threads: usize,

    /// Worker thread name
    pub thread_name: String,

    /// Dead event handling
    pub dead_events: DeadEventPolicy,

    /// Nested publish limit (None = unbounded)
    pub max_publish_depth: Option<usize>,

    /// Enable event logging
    ///
    /// Covers lifecycle and per-publish debug logs. Listener failures and
    /// [`DeadEventPolicy::Log`] warnings are always emitted.
    pub enable_logging: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_worker_threads: 8,
            thread_name: "fanout-worker".to_string(),
            dead_events: DeadEventPolicy::Ignore,
            max_publish_depth: Some(64),
            enable_logging: true,
        }
    }
}

impl EventBusConfig {
    /// Number of worker threads the bus will start.
    pub fn effective_worker_threads(&self) -> usize {
        let threads = self.worker_threads.unwrap_or_else(|| {
            let available = std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1);
            available.min(self.max_worker_threads)
        });
        threads.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == Some(0) {
            return Err(invalid("worker_threads", "0"));
        }
        if self.max_worker_threads == 0 {
            return Err(invalid("max_worker_threads", "0"));
        }
        if self.thread_name.trim().is_empty() {
            return Err(invalid("thread_name", &self.thread_name));
        }
        if self.max_publish_depth == Some(0) {
            return Err(invalid("max_publish_depth", "0"));
        }
        Ok(())
    }

    /// Load from `FANOUT_BUS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_prefix(ENV_PREFIX)
    }

    /// Load from `{prefix}_*` environment variables.
    pub fn from_env_prefix(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| env::var(key))
    }

    /// Load from `{prefix}_*` variables resolved by `lookup`, starting from
    /// the defaults. Unset variables keep their default.
    ///
    /// `MAX_PUBLISH_DEPTH` accepts `none` to disable the limit.
    pub fn from_lookup<F>(prefix: &str, mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Result<String, VarError>,
    {
        let mut var = |name: &str| -> Result<Option<(String, String)>, ConfigError> {
            let key = format!("{}_{}", prefix, name);
            match lookup(&key) {
                Ok(value) => Ok(Some((key, value))),
                Err(VarError::NotPresent) => Ok(None),
                Err(err) => Err(ConfigError::Env(err)),
            }
        };

        let mut config = Self::default();

        if let Some((key, value)) = var("WORKER_THREADS")? {
            config.worker_threads = Some(parse(&key, value)?);
        }
        if let Some((key, value)) = var("MAX_WORKER_THREADS")? {
            config.max_worker_threads = parse(&key, value)?;
        }
        if let Some((_, value)) = var("THREAD_NAME")? {
            config.thread_name = value;
        }
        if let Some((_, value)) = var("DEAD_EVENTS")? {
            config.dead_events = value.parse()?;
        }
        if let Some((key, value)) = var("MAX_PUBLISH_DEPTH")? {
            config.max_publish_depth = if value.trim().eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse(&key, value)?)
            };
        }
        if let Some((key, value)) = var("ENABLE_LOGGING")? {
            config.enable_logging = parse_bool(&key, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields keep their default.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value,
    })
}

fn parse_bool(key: &str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
    }
}
