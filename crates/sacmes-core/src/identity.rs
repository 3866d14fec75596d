//! Identity registry
//!
//! Maps each durable [`Identity`] to the agent channel and session that
//! currently hold it. Registration is atomic per identity: a second live
//! channel is refused, a stale one is replaced and its session state is
//! migrated into the new session.
//!
//! Disconnects are not acted on immediately. [`IdentityRegistry::unregister`]
//! arms a grace timer; when it fires the mapping is removed only if its
//! epoch is unchanged and its channel is still dead, re-read at that moment.
//!
//! Work that rewrites an identity's session state (registration with its
//! migration, starting an analysis) runs under that identity's
//! [`session lock`](IdentityRegistry::lock_session).

use crate::channel::{ChannelHandle, ConnectionSet};
use crate::error::{RegistryError, StoreError};
use crate::session::SessionState;
use crate::types::{ChannelId, Identity, SessionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Current holder of an identity
#[derive(Debug, Clone)]
pub struct Registration {
    /// Session minted for this connection
    pub session_id: SessionId,
    /// Agent channel
    pub channel: ChannelHandle,
    epoch: u64,
}

impl Registration {
    /// Monotonic registration counter; bumps on every accepted register
    #[inline]
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Result of an accepted registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    /// Session now holding the identity
    pub session_id: SessionId,
    /// Session whose state was carried over, if any
    pub migrated_from: Option<SessionId>,
}

/// Identity -> (session, agent channel)
#[derive(Debug)]
pub struct IdentityRegistry {
    entries: DashMap<Identity, Registration>,
    /// sessions kept for viewers after their agent's grace period ran out
    dormant: DashMap<Identity, SessionId>,
    locks: DashMap<Identity, Arc<Mutex<()>>>,
    connections: Arc<ConnectionSet>,
    state: SessionState,
    next_epoch: AtomicU64,
    grace: Duration,
}

impl IdentityRegistry {
    /// Create registry
    #[must_use]
    pub fn new(connections: Arc<ConnectionSet>, state: SessionState, grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            dormant: DashMap::new(),
            locks: DashMap::new(),
            connections,
            state,
            next_epoch: AtomicU64::new(1),
            grace,
        }
    }

    /// Grace period applied on unregister
    #[inline]
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Exclusive access to an identity's session state
    ///
    /// Held by [`register`](Self::register) until its migration is done.
    pub async fn lock_session(&self, identity: &Identity) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(identity.clone()).or_default().value());
        lock.lock_owned().await
    }

    /// Bind `identity` to a new session on `channel`
    ///
    /// Refused when the existing holder's channel is verified live. On
    /// acceptance any previous session (stale mapping or dormant) is
    /// migrated into `session_id` before the session lock is released.
    pub async fn register(
        &self,
        identity: &Identity,
        session_id: SessionId,
        channel: ChannelHandle,
    ) -> Result<Registered, RegistryError> {
        let _serial = self.lock_session(identity).await;
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let fresh = Registration {
            session_id,
            channel,
            epoch,
        };

        let previous = match self.entries.entry(identity.clone()) {
            Entry::Occupied(mut held) => {
                let holder = held.get().channel.id();
                if holder != fresh.channel.id() && self.connections.is_live(holder) {
                    tracing::warn!(identity = %identity, holder = %holder, "identity collision");
                    return Err(RegistryError::IdentityCollision {
                        identity: identity.clone(),
                        holder,
                    });
                }
                Some(held.insert(fresh).session_id)
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                None
            }
        };
        let previous = previous.or_else(|| self.dormant.remove(identity).map(|(_, sid)| sid));

        let migrated_from = match previous {
            Some(old) if old != session_id => {
                match self.state.migrate(old, session_id).await {
                    Ok(copied) => {
                        tracing::info!(
                            identity = %identity,
                            from = %old,
                            to = %session_id,
                            copied,
                            "session migrated on reconnect"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(identity = %identity, from = %old, "session migration failed: {e}");
                    }
                }
                Some(old)
            }
            _ => None,
        };

        tracing::info!(identity = %identity, session = %session_id, epoch, "agent registered");
        Ok(Registered {
            session_id,
            migrated_from,
        })
    }

    /// Current session and channel for an identity
    #[must_use]
    pub fn resolve(&self, identity: &Identity) -> Option<(SessionId, ChannelHandle)> {
        self.entries
            .get(identity)
            .map(|r| (r.session_id, r.channel.clone()))
    }

    /// Like [`resolve`](Self::resolve) but only when the channel is verified live
    #[must_use]
    pub fn resolve_live(&self, identity: &Identity) -> Option<(SessionId, ChannelHandle)> {
        self.resolve(identity)
            .filter(|(_, channel)| self.connections.is_live(channel.id()))
    }

    /// Session to read for an identity: the registered one, else a dormant one
    #[must_use]
    pub fn session_for(&self, identity: &Identity) -> Option<SessionId> {
        self.entries
            .get(identity)
            .map(|r| r.session_id)
            .or_else(|| self.dormant.get(identity).map(|sid| *sid))
    }

    /// Whether a live agent holds the identity
    #[must_use]
    pub fn is_connected(&self, identity: &Identity) -> bool {
        self.resolve_live(identity).is_some()
    }

    /// Schedule removal of `identity` after the grace period
    ///
    /// Returns `None` when `channel` is not the current holder (a newer
    /// registration already superseded it). The handle yields the removed
    /// registration, or `None` if the identity was re-registered meanwhile.
    pub fn unregister(
        self: &Arc<Self>,
        identity: &Identity,
        channel: ChannelId,
    ) -> Option<JoinHandle<Option<Registration>>> {
        let epoch = self
            .entries
            .get(identity)
            .filter(|r| r.channel.id() == channel)
            .map(|r| r.epoch)?;

        let registry = Arc::clone(self);
        let identity = identity.clone();
        tracing::debug!(identity = %identity, grace_secs = self.grace.as_secs(), "grace period started");
        Some(tokio::spawn(async move {
            tokio::time::sleep(registry.grace).await;
            registry.expire_if_current(&identity, epoch)
        }))
    }

    /// Remove the mapping if it still carries `epoch` and its channel is dead
    pub fn expire_if_current(&self, identity: &Identity, epoch: u64) -> Option<Registration> {
        let removed = self
            .entries
            .remove_if(identity, |_, r| {
                r.epoch == epoch && !self.connections.is_live(r.channel.id())
            })
            .map(|(_, r)| r);
        match &removed {
            Some(r) => tracing::info!(identity = %identity, session = %r.session_id, "grace period expired"),
            None => tracing::debug!(identity = %identity, "grace expiry skipped, identity re-registered"),
        }
        removed
    }

    /// Keep an expired session readable for viewers
    pub fn park(&self, identity: &Identity, session: SessionId) {
        self.dormant.insert(identity.clone(), session);
    }

    /// Purge a dormant session if it is still the parked one
    ///
    /// Returns whether anything was purged.
    pub async fn discard_dormant(
        &self,
        identity: &Identity,
        session: SessionId,
    ) -> Result<bool, StoreError> {
        if self.dormant.remove_if(identity, |_, sid| *sid == session).is_none() {
            return Ok(false);
        }
        self.state.purge(session).await?;
        tracing::info!(identity = %identity, session = %session, "dormant session purged");
        Ok(true)
    }

    /// Number of registered identities
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ChannelRole;

    const GRACE: Duration = Duration::from_secs(30);

    fn registry() -> (Arc<IdentityRegistry>, Arc<ConnectionSet>) {
        let connections = Arc::new(ConnectionSet::new());
        let state = SessionState::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600));
        (
            Arc::new(IdentityRegistry::new(connections.clone(), state, GRACE)),
            connections,
        )
    }

    fn open(connections: &ConnectionSet) -> (ChannelHandle, tokio::sync::mpsc::Receiver<crate::protocol::ServerMessage>) {
        let (handle, rx) = ChannelHandle::new(ChannelRole::Agent);
        connections.open(&handle);
        (handle, rx)
    }

    #[tokio::test]
    async fn second_live_channel_is_rejected() {
        let (registry, connections) = registry();
        let id = Identity::new("lab-1");
        let (c1, _rx1) = open(&connections);
        let (c2, _rx2) = open(&connections);

        registry.register(&id, SessionId::new(), c1.clone()).await.unwrap();
        let err = registry.register(&id, SessionId::new(), c2).await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::IdentityCollision {
                identity: id.clone(),
                holder: c1.id(),
            }
        );
        assert_eq!(registry.resolve(&id).unwrap().1.id(), c1.id());
    }

    #[tokio::test]
    async fn stale_mapping_does_not_block_reconnect() {
        let (registry, connections) = registry();
        let id = Identity::new("lab-1");
        let (c1, rx1) = open(&connections);
        let s1 = SessionId::new();
        registry.register(&id, s1, c1).await.unwrap();

        // ungraceful close: receiver gone, ConnectionSet never told
        drop(rx1);

        let (c2, _rx2) = open(&connections);
        let s2 = SessionId::new();
        let outcome = registry.register(&id, s2, c2.clone()).await.unwrap();
        assert_eq!(outcome.migrated_from, Some(s1));
        assert_eq!(registry.resolve(&id).unwrap().0, s2);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_removes_dead_mapping() {
        let (registry, connections) = registry();
        let id = Identity::new("lab-1");
        let (c1, _rx1) = open(&connections);
        registry.register(&id, SessionId::new(), c1.clone()).await.unwrap();

        connections.close(c1.id());
        let timer = registry.unregister(&id, c1.id()).unwrap();
        let removed = timer.await.unwrap();

        assert!(removed.is_some());
        assert!(registry.resolve(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_skipped_after_reconnect() {
        let (registry, connections) = registry();
        let id = Identity::new("lab-1");
        let (c1, _rx1) = open(&connections);
        registry.register(&id, SessionId::new(), c1.clone()).await.unwrap();

        connections.close(c1.id());
        let timer = registry.unregister(&id, c1.id()).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let (c2, _rx2) = open(&connections);
        let s2 = SessionId::new();
        registry.register(&id, s2, c2.clone()).await.unwrap();

        assert!(timer.await.unwrap().is_none());
        let (session, channel) = registry.resolve(&id).unwrap();
        assert_eq!(session, s2);
        assert_eq!(channel.id(), c2.id());
    }

    #[tokio::test]
    async fn unregister_from_superseded_channel_is_ignored() {
        let (registry, connections) = registry();
        let id = Identity::new("lab-1");
        let (c1, rx1) = open(&connections);
        registry.register(&id, SessionId::new(), c1.clone()).await.unwrap();
        drop(rx1);
        let (c2, _rx2) = open(&connections);
        registry.register(&id, SessionId::new(), c2).await.unwrap();

        assert!(registry.unregister(&id, c1.id()).is_none());
    }

    #[tokio::test]
    async fn register_waits_for_the_session_lock() {
        let (registry, connections) = registry();
        let id = Identity::new("lab-1");
        let (c1, _rx1) = open(&connections);

        let guard = registry.lock_session(&id).await;
        let pending = tokio::spawn({
            let registry = Arc::clone(&registry);
            let id = id.clone();
            async move { registry.register(&id, SessionId::new(), c1).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!pending.is_finished());
        assert!(registry.resolve(&id).is_none());

        drop(guard);
        pending.await.unwrap().unwrap();
        assert!(registry.resolve(&id).is_some());
    }

    #[tokio::test]
    async fn dormant_session_is_migrated_on_next_register() {
        let (registry, connections) = registry();
        let id = Identity::new("lab-1");
        let old = SessionId::new();
        registry.park(&id, old);
        assert_eq!(registry.session_for(&id), Some(old));

        let (c1, _rx1) = open(&connections);
        let outcome = registry.register(&id, SessionId::new(), c1).await.unwrap();
        assert_eq!(outcome.migrated_from, Some(old));
        assert!(!registry.discard_dormant(&id, old).await.unwrap());
    }
}
