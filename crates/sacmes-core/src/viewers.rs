//! Viewer groups
//!
//! Each identity has a set of viewer channels. Broadcasts for one identity
//! reach only that identity's set; an identity without viewers simply has
//! no entry.

use crate::channel::ChannelHandle;
use crate::error::ChannelError;
use crate::protocol::ServerMessage;
use crate::types::{ChannelId, Identity};
use dashmap::DashMap;
use std::collections::HashMap;

/// Identity -> viewer channels
#[derive(Debug, Default)]
pub struct ViewerGroups {
    groups: DashMap<Identity, HashMap<ChannelId, ChannelHandle>>,
}

impl ViewerGroups {
    /// Create empty manager
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a viewer to an identity's group
    pub fn join(&self, identity: &Identity, channel: ChannelHandle) {
        self.groups
            .entry(identity.clone())
            .or_default()
            .insert(channel.id(), channel);
    }

    /// Remove a viewer; returns whether the group is now empty
    pub fn leave(&self, identity: &Identity, channel: ChannelId) -> bool {
        let now_empty = match self.groups.get_mut(identity) {
            Some(mut group) => {
                group.remove(&channel);
                group.is_empty()
            }
            None => return true,
        };
        if now_empty {
            self.groups.remove_if(identity, |_, group| group.is_empty());
        }
        now_empty
    }

    /// Current viewers of an identity
    #[must_use]
    pub fn members(&self, identity: &Identity) -> Vec<ChannelHandle> {
        self.groups
            .get(identity)
            .map(|group| group.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of viewers of an identity
    #[must_use]
    pub fn count(&self, identity: &Identity) -> usize {
        self.groups.get(identity).map_or(0, |group| group.len())
    }

    /// Deliver `message` to every viewer of `identity`
    ///
    /// Never blocks: a full viewer queue drops the message for that viewer,
    /// a closed one is removed from the group. Returns how many viewers
    /// received it.
    pub fn broadcast(&self, identity: &Identity, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for viewer in self.members(identity) {
            match viewer.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(ChannelError::Full(id)) => {
                    tracing::warn!(identity = %identity, viewer = %id, kind = message.kind(), "viewer queue full, message dropped");
                }
                Err(ChannelError::Closed(id)) => closed.push(id),
            }
        }
        for id in closed {
            tracing::debug!(identity = %identity, viewer = %id, "pruning closed viewer");
            self.leave(identity, id);
        }
        delivered
    }

    /// Identities with at least one viewer
    #[must_use]
    pub fn identities(&self) -> Vec<Identity> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }
}
