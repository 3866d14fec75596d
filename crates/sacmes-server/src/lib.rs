//! SACMES relay server
//!
//! Exposes a [`RelayHub`] over WebSockets:
//! - `GET /agent`: instrument agents (bearer token when configured)
//! - `GET /viewer`: browser viewers
//! - `GET /health`: connection counts and dispatcher load
//!
//! Each socket becomes a hub channel; frames are parsed into
//! [`AgentMessage`](sacmes_core::AgentMessage) or
//! [`ViewerMessage`](sacmes_core::ViewerMessage) and turned into hub calls.

#![warn(unreachable_pub)]

pub mod routes;
pub mod socket;

pub use routes::routes;

use sacmes_core::RelayHub;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Server startup errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configured bind address does not parse
    #[error("invalid bind address {addr}: {source}")]
    BadAddress {
        /// The configured value
        addr: String,
        /// Parse failure
        #[source]
        source: std::net::AddrParseError,
    },

    /// Listener could not be bound
    #[error("bind failed: {0}")]
    Bind(#[from] warp::Error),
}

/// Bind the relay on `addr` and serve until `shutdown` resolves
///
/// Returns the bound address (useful with port 0) and the server task.
pub fn spawn<F>(
    hub: Arc<RelayHub>,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(SocketAddr, JoinHandle<()>), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (bound, server) =
        warp::serve(routes(hub)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    tracing::info!(addr = %bound, "relay listening");
    Ok((bound, tokio::spawn(server)))
}

/// Parse the configured bind address
pub fn bind_address(raw: &str) -> Result<SocketAddr, ServerError> {
    raw.parse().map_err(|source| ServerError::BadAddress {
        addr: raw.to_string(),
        source,
    })
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
