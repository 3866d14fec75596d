//! HTTP routes and WebSocket upgrades

use crate::socket;
use sacmes_core::{ChannelRole, RegistryError, RelayError, RelayHub};
use serde::Serialize;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::ws::Ws;
use warp::{Filter, Rejection, Reply};

/// Health snapshot served on `/health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    /// Crate version
    pub version: &'static str,
    /// Open agent sockets
    pub agents: usize,
    /// Open viewer sockets
    pub viewers: usize,
    /// Analysis tasks running
    pub dispatch_used: usize,
    /// Dispatcher capacity
    pub dispatch_total: usize,
}

impl Health {
    /// Read the hub's current counters
    #[must_use]
    pub fn of(hub: &RelayHub) -> Self {
        let load = hub.dispatcher().load();
        Self {
            version: crate::VERSION,
            agents: hub.connections().count(ChannelRole::Agent),
            viewers: hub.connections().count(ChannelRole::Viewer),
            dispatch_used: load.used,
            dispatch_total: load.total,
        }
    }
}

/// Whether an `Authorization` header satisfies the configured token
///
/// No configured token means every agent is accepted.
#[must_use]
pub fn authorized(expected: Option<&str>, header: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(token) => header
            .and_then(|h| h.strip_prefix("Bearer "))
            .is_some_and(|given| given.trim() == token),
    }
}

// Agents skip files over max_file_bytes before sending; this only stops
// frames that ignore it. JSON escaping can double the raw size.
fn frame_limit(hub: &RelayHub) -> usize {
    hub.config()
        .validation
        .max_file_bytes
        .saturating_mul(2)
        .max(64 * 1024)
}

/// All relay routes
pub fn routes(
    hub: Arc<RelayHub>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_hub = warp::any().map(move || Arc::clone(&hub));

    let agent = warp::path("agent")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_hub.clone())
        .map(|ws: Ws, auth: Option<String>, hub: Arc<RelayHub>| -> Box<dyn Reply> {
            if !authorized(hub.config().auth_token.as_deref(), auth.as_deref()) {
                tracing::warn!("agent upgrade refused: bad or missing token");
                let reason = RelayError::from(RegistryError::Unauthorized).client_reason();
                return Box::new(warp::reply::with_status(reason, StatusCode::UNAUTHORIZED));
            }
            let limit = frame_limit(&hub);
            Box::new(
                ws.max_message_size(limit)
                    .on_upgrade(move |ws| socket::agent_session(ws, hub)),
            )
        });

    let viewer = warp::path("viewer")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_hub.clone())
        .map(|ws: Ws, hub: Arc<RelayHub>| {
            ws.on_upgrade(move |ws| socket::viewer_session(ws, hub))
        });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_hub)
        .map(|hub: Arc<RelayHub>| warp::reply::json(&Health::of(&hub)));

    agent
        .or(viewer)
        .or(health)
        .with(warp::trace::request())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_relay_accepts_anyone() {
        assert!(authorized(None, None));
        assert!(authorized(None, Some("Bearer whatever")));
    }

    #[test]
    fn token_must_match_bearer_header() {
        assert!(authorized(Some("s3cret"), Some("Bearer s3cret")));
        assert!(!authorized(Some("s3cret"), Some("Bearer other")));
        assert!(!authorized(Some("s3cret"), Some("s3cret")));
        assert!(!authorized(Some("s3cret"), None));
    }
}
