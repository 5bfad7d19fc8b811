//! Error types for the event bus

use crate::types::TypeKey;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Boxed error returned by listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias for synchronous bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;

/// Errors raised synchronously by subscribe/unsubscribe and construction.
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("`{target}` declares no event handlers")]
    NoHandlers { target: &'static str },

    #[error("Subscription handle was not issued by this event bus")]
    ForeignHandle,

    #[error("Failed to start worker pool: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of a publish, reported through its [`PublishFuture`](crate::PublishFuture).
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Event bus is closed")]
    Closed,

    #[error(transparent)]
    ListenersFailed(Failures),

    #[error("Publish depth {depth} reached the limit of {limit}")]
    DepthExceeded { depth: usize, limit: usize },

    #[error("{pending} listener invocation(s) interrupted by shutdown")]
    Interrupted { pending: usize },
}

impl PublishError {
    /// Listener failures carried by this error, if any.
    pub fn failures(&self) -> Option<&Failures> {
        match self {
            PublishError::ListenersFailed(failures) => Some(failures),
            _ => None,
        }
    }
}

/// Non-empty list of listener failures, in the order they were observed.
#[derive(Debug)]
pub struct Failures(Vec<ListenerFailure>);

impl Failures {
    pub(crate) fn new(failures: Vec<ListenerFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self(failures))
        }
    }

    /// First observed failure.
    pub fn first(&self) -> &ListenerFailure {
        &self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenerFailure> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<ListenerFailure> {
        self.0
    }
}

impl fmt::Display for Failures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} listener(s) failed, first: {}", self.0.len(), self.first())
    }
}

impl std::error::Error for Failures {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.first())
    }
}

/// What went wrong inside one listener invocation.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener returned an error: {0}")]
    Failed(#[source] BoxError),

    #[error("deferred reply failed: {0}")]
    Deferred(#[source] BoxError),

    #[error("listener panicked: {0}")]
    Panicked(String),

    #[error("event could not be viewed as `{expected}`")]
    TypeMismatch { expected: &'static str },
}

/// A captured listener failure, annotated with dispatch context.
#[derive(Debug, Error)]
#[error("`{callback}` on `{target}` failed handling {event} (key `{key}`): {cause}")]
pub struct ListenerFailure {
    event: String,
    key: TypeKey,
    target: String,
    callback: &'static str,
    failed_at: DateTime<Utc>,
    #[source]
    cause: ListenerError,
}

impl ListenerFailure {
    pub(crate) fn new(
        event: String,
        key: TypeKey,
        target: String,
        callback: &'static str,
        cause: ListenerError,
    ) -> Self {
        Self {
            event,
            key,
            target,
            callback,
            failed_at: Utc::now(),
            cause,
        }
    }

    /// `Debug` rendering of the event being dispatched.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Key the failing subscription was registered under.
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// Identity of the listener target.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Name of the failing callback.
    pub fn callback(&self) -> &'static str {
        self.callback
    }

    pub fn failed_at(&self) -> DateTime<Utc> {
        self.failed_at
    }

    pub fn cause(&self) -> &ListenerError {
        &self.cause
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}
