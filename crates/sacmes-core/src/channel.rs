//! Channel handles and the live-connection set
//!
//! A [`ChannelHandle`] is the relay-side view of one network connection:
//! an id, a role and the outbound queue the transport drains. The
//! [`ConnectionSet`] is the source of truth for which channels are live;
//! registry liveness checks go through it rather than trusting a stored
//! handle.

use crate::error::ChannelError;
use crate::protocol::ServerMessage;
use crate::types::{ChannelId, ChannelRole};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Outbound queue depth per channel
pub const CHANNEL_BUFFER: usize = 100;

/// Handle for sending to one connection
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    role: ChannelRole,
    sender: mpsc::Sender<ServerMessage>,
}

impl ChannelHandle {
    /// Create a handle and the receiver the transport drains
    #[must_use]
    pub fn new(role: ChannelRole) -> (Self, mpsc::Receiver<ServerMessage>) {
        Self::with_capacity(role, CHANNEL_BUFFER)
    }

    /// Create with explicit queue depth
    #[must_use]
    pub fn with_capacity(role: ChannelRole, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ChannelId::new(),
            role,
            sender,
        };
        (handle, rx)
    }

    /// Channel ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Channel role
    #[inline]
    #[must_use]
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Whether the receiving side has gone away
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Send, waiting for queue space
    pub async fn send(&self, message: ServerMessage) -> Result<(), ChannelError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ChannelError::Closed(self.id))
    }

    /// Send without waiting; a full queue is reported rather than awaited
    pub fn try_send(&self, message: ServerMessage) -> Result<(), ChannelError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full(self.id),
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed(self.id),
        })
    }
}

/// Set of currently open connections
#[derive(Debug, Default)]
pub struct ConnectionSet {
    live: DashMap<ChannelId, ChannelHandle>,
}

impl ConnectionSet {
    /// Create empty set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an opened connection
    pub fn open(&self, handle: &ChannelHandle) {
        self.live.insert(handle.id(), handle.clone());
    }

    /// Record a closed connection
    pub fn close(&self, id: ChannelId) -> Option<ChannelHandle> {
        self.live.remove(&id).map(|(_, handle)| handle)
    }

    /// Whether a channel is verified live: present and its receiver open
    #[must_use]
    pub fn is_live(&self, id: ChannelId) -> bool {
        self.live.get(&id).is_some_and(|h| !h.is_closed())
    }

    /// Look up a live channel
    #[must_use]
    pub fn get(&self, id: ChannelId) -> Option<ChannelHandle> {
        self.live
            .get(&id)
            .filter(|h| !h.is_closed())
            .map(|h| h.clone())
    }

    /// Number of open connections with a role
    #[must_use]
    pub fn count(&self, role: ChannelRole) -> usize {
        self.live.iter().filter(|e| e.value().role() == role).count()
    }
}
