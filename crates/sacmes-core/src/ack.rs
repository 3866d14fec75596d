//! Acknowledgment routing
//!
//! Completion messages are addressed by identity, not by channel. The
//! channel is looked up through an injected resolver at the moment the
//! message is sent, so a task that outlives its agent's connection still
//! reaches the agent's new connection.

use crate::channel::ChannelHandle;
use crate::protocol::ServerMessage;
use crate::types::{Identity, SessionId};
use std::fmt;
use std::sync::Arc;

/// Lookup of the current (session, channel) for an identity
pub type Resolver = Arc<dyn Fn(&Identity) -> Option<(SessionId, ChannelHandle)> + Send + Sync>;

/// What happened to a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Sent on the identity's current channel
    Delivered {
        /// Session that received it
        session: SessionId,
        /// Whether that session differs from the one at submit time
        migrated: bool,
    },
    /// No live channel for the identity; message dropped
    Dropped,
}

/// Routes messages to whichever channel holds an identity now
#[derive(Clone)]
pub struct AckRouter {
    resolve: Resolver,
}

impl fmt::Debug for AckRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckRouter").finish_non_exhaustive()
    }
}

impl AckRouter {
    /// Create router over a resolver
    #[must_use]
    pub fn new(resolve: Resolver) -> Self {
        Self { resolve }
    }

    /// Send `message` to the current channel for `identity`
    pub async fn route(
        &self,
        identity: &Identity,
        submitted_in: SessionId,
        message: ServerMessage,
    ) -> AckOutcome {
        let Some((session, channel)) = (self.resolve)(identity) else {
            tracing::warn!(identity = %identity, kind = message.kind(), "no agent channel, ack dropped");
            return AckOutcome::Dropped;
        };
        let kind = message.kind();
        match channel.send(message).await {
            Ok(()) => {
                let migrated = session != submitted_in;
                if migrated {
                    tracing::debug!(
                        identity = %identity,
                        from = %submitted_in,
                        to = %session,
                        kind,
                        "ack routed to reconnected agent"
                    );
                }
                AckOutcome::Delivered { session, migrated }
            }
            Err(e) => {
                tracing::warn!(identity = %identity, kind, "ack dropped: {e}");
                AckOutcome::Dropped
            }
        }
    }
}
