//! SACMES instrument agent
//!
//! Streams measurement files from a local directory to the relay:
//! - [`FilterSet`] decides which files the current analysis wants
//! - [`plan_delivery`] orders them by file index, frequencies together
//! - [`DeliveryLoop`] sends one file at a time, paced by acknowledgments
//!   and the server's send-rate instructions
//! - [`AgentClient`] owns the connection and reconnects with backoff
//! - [`IdentityFile`] keeps the agent's identity stable across restarts

#![warn(unreachable_pub)]

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod filter;
pub mod identity;
pub mod plan;

pub use client::AgentClient;
pub use config::{default_identity_file, AgentConfig, DeliverySettings, ReconnectPolicy};
pub use delivery::{Control, DeliveryLoop, DeliveryReport, FileSink, RunOutcome};
pub use error::{AgentError, AgentResult};
pub use filter::FilterSet;
pub use identity::IdentityFile;
pub use plan::plan_delivery;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
