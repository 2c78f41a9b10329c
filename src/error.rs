//! Error types for the channel relay.

use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Source/destination channel errors (subscription and history access).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Fetching history from {channel} failed: {reason}")]
    FetchFailed { channel: String, reason: String },

    #[error("Channel {name} does not support {operation}")]
    Unsupported { name: String, operation: String },
}

/// Outbound send failure, classified for the dispatcher's retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rejected by target: {0}")]
    Rejected(String),
}

/// State store errors. Only surfaced internally; load and flush log them.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt state file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No source channels configured")]
    NoSources,

    #[error("Source subscription failed: {0}")]
    Subscribe(#[from] ChannelError),

    #[error("Cannot poll {channel}: {source}")]
    HistoryUnsupported {
        channel: String,
        source: ChannelError,
    },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
