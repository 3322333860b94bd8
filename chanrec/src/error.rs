//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The platform API was unreachable or answered with something unusable.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Failed to spawn {program}: {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture process for {channel} exited unexpectedly: {reason}")]
    ProcessCrash { channel: String, reason: String },

    #[error("Conversion of {} failed: {reason}", raw_path.display())]
    Conversion { raw_path: PathBuf, reason: String },

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Channel {channel} is already transitioning ({state})")]
    ConcurrentTransition { channel: String, state: String },

    #[error("Channel already registered: {0}")]
    DuplicateChannel(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Chat feed error: {0}")]
    Chat(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::ProcessSpawn {
            program: program.into(),
            source,
        }
    }

    pub fn conversion(raw_path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Conversion {
            raw_path: raw_path.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_channel(name: impl Into<String>) -> Self {
        Self::UnknownChannel(name.into())
    }

    pub fn chat(msg: impl Into<String>) -> Self {
        Self::Chat(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether retrying the same operation on a later tick may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_) | Self::WebSocket(_) | Self::Chat(_) => true,
            Self::Http(e) => !e.is_status() || e.status().is_some_and(|s| s.is_server_error()),
            _ => false,
        }
    }
}
