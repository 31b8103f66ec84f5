//! Error taxonomy for the watcher.
//!
//! Only [`ConfigError`] is allowed to stop the process, and only at startup.
//! Every other error is logged by the task that hit it and the task carries on.
use std::path::PathBuf;
use std::time::Duration;

/// Fatal startup errors: the daemon refuses to start when any of these occur.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown activation mode '{0}' (expected polling, event-driven, hooks or hybrid)")]
    UnknownMode(String),

    #[error("worker name is required (set `worker` in the config file, BEACON_WORKER or --worker)")]
    MissingWorker,

    #[error("invalid worker name '{0}': must be non-empty, without path separators, and not start with '.'")]
    InvalidWorker(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("required directory {key} does not exist: {}", path.display())]
    MissingDirectory { key: &'static str, path: PathBuf },

    #[error("{} exists but is not a named pipe", .0.display())]
    NotAFifo(PathBuf),

    #[error("failed to create named pipe {}: {source}", path.display())]
    CreateFifo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the trigger channel.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("invalid {field} '{value}': must be non-empty and must not contain '/', '\\' or start with '.'")]
    InvalidName { field: &'static str, value: String },

    #[error("payload is {size} bytes, larger than the {limit} byte limit; reference large data by path")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("malformed trigger {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the control/status pipe pair.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("no counterpart attached to {} after {:?}", path.display(), waited)]
    Timeout { path: PathBuf, waited: Duration },

    #[error("invalid control command '{0}'")]
    InvalidCommand(String),

    #[error("malformed status reply: {0}")]
    MalformedReply(String),

    #[error("pipe closed by counterpart")]
    Closed,

    #[error("{} was removed or replaced while attached", .0.display())]
    Vanished(PathBuf),

    #[error(transparent)]
    Setup(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the optional external broker. Callers always degrade these
/// to a warning.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unsupported broker url '{0}' (expected redis://host:port)")]
    UnsupportedUrl(String),

    #[error("broker did not respond within {0:?}")]
    Timeout(Duration),

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
