//! Agent error types

use std::path::PathBuf;

/// Agent-side errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Filesystem access failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Identity file exists but holds no usable identity
    #[error("identity file {0} is empty or malformed")]
    BadIdentityFile(PathBuf),

    /// WebSocket handshake or transport failure
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Server refused the connection
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// Server sent something out of sequence
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Outbound queue is gone; the connection is down
    #[error("connection closed")]
    Closed,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Reconnection attempts used up
    #[error("gave up after {0} connection attempts")]
    GaveUp(u32),
}

impl AgentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether reconnecting may help
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Rejected(_) | Self::Closed | Self::Protocol(_)
        )
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
