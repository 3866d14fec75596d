//! SACMES relay core
//!
//! The server-side machinery between instrument agents and browser viewers:
//! - Identity registry with collision detection and reconnection migration
//! - Viewer groups with per-identity fan-out
//! - Session state store (in-process, or clustered with the `cluster` feature)
//! - Concurrency-bounded dispatch of analysis work
//! - Adaptive flow control and identity-addressed acknowledgments
//!
//! [`RelayHub`] ties these together behind a transport-agnostic API.
//!
//! # Example
//!
//! ```rust,ignore
//! use sacmes_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> RelayResult<()> {
//! let hub = RelayHub::open(RelayConfig::new(), Arc::new(PeakCurrentAnalyzer)).await;
//!
//! let (agent, _agent_rx) = hub.open_channel(ChannelRole::Agent);
//! let (identity, session) = hub.agent_connected("lab-3", &agent).await?;
//! println!("{identity} holds session {session}");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod ack;
pub mod analyzer;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod flow;
pub mod hub;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod store;
pub mod trends;
pub mod types;
pub mod validation;
pub mod viewers;

// Re-exports for convenience
pub use ack::{AckOutcome, AckRouter, Resolver};
pub use analyzer::{Analyzer, PeakCurrentAnalyzer, MAX_ELECTRODES};
pub use channel::{ChannelHandle, ConnectionSet, CHANNEL_BUFFER};
pub use config::{FlowConfig, RelayConfig, SessionLimits, StoreConfig, ValidationConfig};
pub use dispatcher::{DispatchStats, Dispatcher, LoadMetric};
pub use error::{
    ChannelError, ConfigError, DispatchError, RegistryError, RelayError, RelayResult, StoreError,
    ValidationError,
};
pub use flow::{clamp_interval, FlowController, RateAdjustment, SendMode};
pub use hub::{PendingAck, RelayHub};
pub use identity::{IdentityRegistry, Registered, Registration};
pub use protocol::{extension_of, AckStatus, AgentMessage, MeasurementName, ServerMessage, ViewerMessage};
pub use session::{Progress, ProgressCounts, SessionState, WarningEntry};
pub use store::{open_store, MemoryStore, StateStore};
pub use trends::{calculate_trends, TrendReport, MAX_TREND_CELLS};
pub use types::{
    AccumulatedResult, AnalysisParams, AnalysisResult, AnalysisStatus, ChannelId, ChannelRole,
    FilterSpec, Identity, ResultKey, SessionId,
};
pub use validation::{check_params, FileValidator, ValidatedFile};
pub use viewers::ViewerGroups;

#[cfg(feature = "cluster")]
pub use store::RedisStore;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the relay core
    pub use crate::{
        AgentMessage, AnalysisParams, Analyzer, ChannelHandle, ChannelRole, FilterSpec, Identity,
        PeakCurrentAnalyzer, RelayConfig, RelayError, RelayHub, RelayResult, ServerMessage,
        SessionId, ViewerMessage,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
