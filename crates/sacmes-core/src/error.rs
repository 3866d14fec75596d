//! Error types for the relay core
//!
//! Provides error handling for:
//! - Inbound file validation (rejected to sender, channel stays open)
//! - Identity collisions at registration
//! - State store failures
//! - Channel delivery failures
//! - Configuration problems

use crate::types::{ChannelId, Identity};

/// Main relay error type
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Inbound file rejected
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Registration refused or lookup failed
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// State store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Message could not be delivered to a channel
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Dispatcher could not run a task
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Viewer asked for something that needs a live agent
    #[error("no agent connected for {0}")]
    AgentNotConnected(Identity),

    /// Message arrived in a state where it is not allowed
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl RelayError {
    /// Whether the connection that caused the error may keep going
    ///
    /// Nothing here is fatal to the process; this only decides whether the
    /// offending channel stays open.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !self.closes_channel()
    }

    /// Whether the transport should close the offending channel
    #[inline]
    #[must_use]
    pub fn closes_channel(&self) -> bool {
        matches!(
            self,
            Self::Registry(RegistryError::IdentityCollision { .. })
                | Self::Registry(RegistryError::Unauthorized)
                | Self::Channel(ChannelError::Closed(_))
        )
    }

    /// Reason string suitable for a client-facing message
    #[must_use]
    pub fn client_reason(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Registry(e) => e.to_string(),
            Self::AgentNotConnected(_) => "Error: Local agent not detected.".to_string(),
            Self::Protocol(msg) => msg.clone(),
            // internal detail stays in the log
            Self::Store(_) | Self::Channel(_) | Self::Dispatch(_) | Self::Config(_) => {
                "internal server error".to_string()
            }
        }
    }
}

/// Inbound file validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Extension not on the allow-list
    #[error("extension not allowed: '{0}'")]
    DisallowedExtension(String),

    /// Content larger than the ceiling
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge {
        /// Received size
        size: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// Content looks like a binary or executable
    #[error("binary content rejected: {0}")]
    BinaryContent(&'static str),

    /// Name does not follow the measurement naming scheme
    #[error("unrecognized filename: '{0}'")]
    UnrecognizedName(String),

    /// Name contains path separators or is empty
    #[error("invalid filename: '{0}'")]
    InvalidName(String),

    /// Analysis parameter beyond the configured bound
    #[error("{name} out of range: {value} (limit {limit})")]
    ParamOutOfRange {
        /// Parameter as the viewer names it
        name: &'static str,
        /// Requested value
        value: u64,
        /// Configured bound
        limit: u64,
    },

    /// No analysis session has been started for this identity
    #[error("no active analysis session")]
    SessionNotStarted,
}

/// Identity registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A live channel already holds this identity
    #[error("identity '{identity}' is already connected on channel {holder}")]
    IdentityCollision {
        /// Contested identity
        identity: Identity,
        /// Channel currently holding it
        holder: ChannelId,
    },

    /// Identity missing or malformed
    #[error("invalid identity: '{0}'")]
    InvalidIdentity(String),

    /// Bearer token missing or wrong
    #[error("unauthorized")]
    Unauthorized,

    /// Identity is not registered
    #[error("identity not registered: {0}")]
    NotRegistered(Identity),
}

/// State store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or returned an error
    #[error("backend error: {0}")]
    Backend(String),

    /// Stored value could not be (de)serialized
    #[error("serialization error for key '{key}': {source}")]
    Serialization {
        /// Key being read or written
        key: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Stored value has the wrong shape for the operation
    #[error("type mismatch for key '{0}'")]
    TypeMismatch(String),
}

impl StoreError {
    /// Create serialization error for key
    pub fn serialization(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            key: key.into(),
            source,
        }
    }
}

/// Channel delivery errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Receiving side is gone
    #[error("channel {0} closed")]
    Closed(ChannelId),

    /// Outbound buffer full
    #[error("channel {0} full")]
    Full(ChannelId),
}

/// Dispatcher errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Admission gate closed during shutdown
    #[error("dispatcher shut down")]
    ShutDown,

    /// Task panicked; its slot was still released
    #[error("task failed: {0}")]
    TaskPanicked(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        /// Config path
        path: std::path::PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File could not be parsed
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override not parseable
    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// Values are individually fine but inconsistent together
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
