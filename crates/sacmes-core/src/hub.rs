//! Relay hub
//!
//! Transport-agnostic server side of the relay. A transport turns each
//! connection into a [`ChannelHandle`] (via [`RelayHub::open_channel`]),
//! drains its receiver onto the wire, and calls one hub method per inbound
//! event. Everything else (registration, fan-out, validation, dispatch,
//! flow control, ack routing) happens here.

use crate::ack::{AckOutcome, AckRouter};
use crate::analyzer::Analyzer;
use crate::channel::{ChannelHandle, ConnectionSet};
use crate::config::RelayConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{RegistryError, RelayError, RelayResult, ValidationError};
use crate::flow::FlowController;
use crate::identity::IdentityRegistry;
use crate::protocol::{AckStatus, ServerMessage};
use crate::session::{Progress, SessionState};
use crate::store::{open_store, StateStore};
use crate::trends::{calculate_trends, TrendReport};
use crate::types::{
    AccumulatedResult, AnalysisParams, AnalysisResult, AnalysisStatus, ChannelId, ChannelRole,
    FilterSpec, Identity, ResultKey, SessionId,
};
use crate::validation::{check_params, FileValidator};
use crate::viewers::ViewerGroups;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// The one file an agent is waiting on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    /// File sent
    pub filename: String,
    /// Session it arrived in
    pub session: SessionId,
    /// Arrival time
    pub sent_at: Instant,
    /// When the agent gives up waiting
    pub deadline: Instant,
}

/// Server side of the relay
#[derive(Debug)]
pub struct RelayHub {
    config: RelayConfig,
    state: SessionState,
    connections: Arc<ConnectionSet>,
    registry: Arc<IdentityRegistry>,
    viewers: ViewerGroups,
    dispatcher: Dispatcher,
    flow: FlowController,
    acks: AckRouter,
    validator: FileValidator,
    analyzer: Arc<dyn Analyzer>,
    pending: DashMap<Identity, PendingAck>,
}

impl RelayHub {
    /// Build a hub over an existing store
    #[must_use]
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn StateStore>,
        analyzer: Arc<dyn Analyzer>,
    ) -> Arc<Self> {
        let state = SessionState::new(store, config.store.session_ttl());
        let connections = Arc::new(ConnectionSet::new());
        let registry = Arc::new(IdentityRegistry::new(
            Arc::clone(&connections),
            state.clone(),
            config.grace_period(),
        ));
        let lookup = Arc::clone(&registry);
        let acks = AckRouter::new(Arc::new(move |identity: &Identity| {
            lookup.resolve_live(identity)
        }));

        tracing::info!(
            capacity = config.dispatch_capacity,
            backend = state.store().backend(),
            analyzer = analyzer.name(),
            "relay hub ready"
        );
        Arc::new(Self {
            dispatcher: Dispatcher::new(config.dispatch_capacity),
            flow: FlowController::new(config.flow.clone()),
            validator: FileValidator::new(&config.validation),
            viewers: ViewerGroups::new(),
            pending: DashMap::new(),
            config,
            state,
            connections,
            registry,
            acks,
            analyzer,
        })
    }

    /// Build a hub, opening the configured store
    pub async fn open(config: RelayConfig, analyzer: Arc<dyn Analyzer>) -> Arc<Self> {
        let store = open_store(&config.store).await;
        Self::new(config, store, analyzer)
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Identity registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    /// Viewer groups
    #[inline]
    #[must_use]
    pub fn viewers(&self) -> &ViewerGroups {
        &self.viewers
    }

    /// Dispatcher
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Session state accessors
    #[inline]
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Live connections
    #[inline]
    #[must_use]
    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    /// File an identity's agent is waiting on, if any
    #[must_use]
    pub fn pending_ack(&self, identity: &Identity) -> Option<PendingAck> {
        self.pending.get(identity).map(|p| p.clone())
    }

    /// Create a channel for a new connection and mark it live
    #[must_use]
    pub fn open_channel(&self, role: ChannelRole) -> (ChannelHandle, mpsc::Receiver<ServerMessage>) {
        let (handle, rx) = ChannelHandle::new(role);
        self.connections.open(&handle);
        tracing::debug!(channel = %handle.id(), ?role, "channel opened");
        (handle, rx)
    }

    /// Mark a channel dead without any identity bookkeeping
    pub fn close_channel(&self, channel: ChannelId) {
        if self.connections.close(channel).is_some() {
            tracing::debug!(channel = %channel, "channel closed");
        }
    }

    /// Agent sent `connect`
    ///
    /// On success the agent gets `session-assigned` and the identity's
    /// viewers get `agent-status`. A collision sends `connection-rejected`
    /// and the transport should close the channel.
    pub async fn agent_connected(
        &self,
        raw_identity: &str,
        channel: &ChannelHandle,
    ) -> RelayResult<(Identity, SessionId)> {
        let outcome = match Identity::parse(raw_identity) {
            Some(identity) => self
                .registry
                .register(&identity, SessionId::new(), channel.clone())
                .await
                .map(|registered| (identity, registered))
                .map_err(RelayError::from),
            None => Err(RegistryError::InvalidIdentity(raw_identity.to_string()).into()),
        };
        let (identity, registered) = match outcome {
            Ok(ok) => ok,
            Err(e) => {
                let _ = channel
                    .send(ServerMessage::ConnectionRejected {
                        reason: e.client_reason(),
                    })
                    .await;
                return Err(e);
            }
        };

        let session_id = registered.session_id;
        channel
            .send(ServerMessage::SessionAssigned { session_id })
            .await?;
        self.viewers.broadcast(
            &identity,
            &ServerMessage::AgentStatus {
                identity: identity.clone(),
                connected: true,
            },
        );
        Ok((identity, session_id))
    }

    /// Agent connection closed
    ///
    /// Arms the grace timer. The returned task finishes after the grace
    /// period; it is `None` when this channel no longer held the identity.
    pub fn agent_disconnected(
        self: &Arc<Self>,
        identity: &Identity,
        channel: ChannelId,
    ) -> Option<JoinHandle<()>> {
        self.close_channel(channel);
        let timer = self.registry.unregister(identity, channel)?;
        let hub = Arc::clone(self);
        let identity = identity.clone();
        Some(tokio::spawn(async move {
            let Ok(Some(expired)) = timer.await else {
                return;
            };
            hub.flow.forget(&identity);
            hub.pending.remove(&identity);
            hub.viewers.broadcast(
                &identity,
                &ServerMessage::AgentStatus {
                    identity: identity.clone(),
                    connected: false,
                },
            );
            if hub.viewers.count(&identity) == 0 {
                match hub.state.purge(expired.session_id).await {
                    Ok(removed) => {
                        tracing::info!(identity = %identity, session = %expired.session_id, removed, "session retired");
                    }
                    Err(e) => tracing::warn!(identity = %identity, "session purge failed: {e}"),
                }
            } else {
                hub.registry.park(&identity, expired.session_id);
            }
        }))
    }

    /// Viewer sent `join-monitor`
    ///
    /// Replies with the agent's status and a replay of everything
    /// accumulated so far.
    pub async fn viewer_joined(
        &self,
        raw_identity: &str,
        channel: &ChannelHandle,
    ) -> RelayResult<Identity> {
        let identity = Identity::parse(raw_identity)
            .ok_or_else(|| RegistryError::InvalidIdentity(raw_identity.to_string()))?;
        self.viewers.join(&identity, channel.clone());
        tracing::info!(identity = %identity, viewer = %channel.id(), "viewer joined");

        channel
            .send(ServerMessage::AgentStatus {
                identity: identity.clone(),
                connected: self.registry.is_connected(&identity),
            })
            .await?;

        let (results, trends) = match self.registry.session_for(&identity) {
            Some(session) => self.snapshot(session).await?,
            None => (Vec::new(), None),
        };
        channel
            .send(ServerMessage::HistoricalReplay {
                identity: identity.clone(),
                results,
                trends,
            })
            .await?;
        Ok(identity)
    }

    /// Viewer connection closed or switched identity
    ///
    /// When the last viewer of an identity without an agent leaves, its
    /// dormant session is purged after the grace period unless someone
    /// comes back.
    pub fn viewer_left(
        self: &Arc<Self>,
        identity: &Identity,
        channel: ChannelId,
    ) -> Option<JoinHandle<()>> {
        if !self.viewers.leave(identity, channel) || self.registry.resolve(identity).is_some() {
            return None;
        }
        let session = self.registry.session_for(identity)?;
        let hub = Arc::clone(self);
        let identity = identity.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(hub.registry.grace()).await;
            if hub.viewers.count(&identity) > 0 {
                return;
            }
            if let Err(e) = hub.registry.discard_dormant(&identity, session).await {
                tracing::warn!(identity = %identity, "dormant purge failed: {e}");
            }
        }))
    }

    /// Viewer sent `start-session`
    ///
    /// Stores the parameters in the agent's current session, resets its
    /// results, forwards `set-filters` to the agent and answers the viewer
    /// with `session-start-ack`.
    pub async fn start_session(
        &self,
        identity: &Identity,
        viewer: &ChannelHandle,
        params: AnalysisParams,
        filters: FilterSpec,
    ) -> RelayResult<()> {
        let outcome = self.begin_session(identity, params, filters).await;
        let ack = match &outcome {
            Ok(()) => ServerMessage::SessionStartAck {
                status: AckStatus::Success,
                message: "Instructions sent to local agent.".to_string(),
            },
            Err(e) => ServerMessage::SessionStartAck {
                status: AckStatus::Error,
                message: e.client_reason(),
            },
        };
        viewer.send(ack).await?;
        outcome
    }

    async fn begin_session(
        &self,
        identity: &Identity,
        params: AnalysisParams,
        mut filters: FilterSpec,
    ) -> RelayResult<()> {
        check_params(&self.config.limits, &params)?;
        // a reconnect in flight finishes its migration before results are cleared
        let _serial = self.registry.lock_session(identity).await;
        let (session, agent) = self
            .registry
            .resolve_live(identity)
            .ok_or_else(|| RelayError::AgentNotConnected(identity.clone()))?;

        filters.file_extension.clone_from(&params.file_extension);
        filters.ack_timeout_secs = Some(self.config.ack_timeout_secs);
        filters.send_interval_secs = Some(self.flow.initial_interval());
        filters.max_file_bytes = u64::try_from(self.config.validation.max_file_bytes).ok();

        self.state.set_params(session, &params).await?;
        self.state.set_filters(session, &filters).await?;
        self.state.clear_results(session).await?;
        self.pending.remove(identity);
        self.flow.forget(identity);

        agent.send(ServerMessage::SetFilters { filters }).await?;
        tracing::info!(identity = %identity, session = %session, "analysis session started");
        Ok(())
    }

    /// Viewer sent `stop-session`
    pub async fn stop_session(&self, identity: &Identity) -> RelayResult<()> {
        let (_, agent) = self
            .registry
            .resolve_live(identity)
            .ok_or_else(|| RelayError::AgentNotConnected(identity.clone()))?;
        self.pending.remove(identity);
        agent.send(ServerMessage::Stop).await?;
        tracing::info!(identity = %identity, "stop forwarded to agent");
        Ok(())
    }

    /// Agent sent `file-data`
    ///
    /// Validation failures are answered on the agent channel with
    /// `file-validation-error` (which also ends the agent's wait) and
    /// returned; the channel stays open. Accepted files are analyzed on a
    /// spawned task whose handle is returned.
    pub async fn file_received(
        self: &Arc<Self>,
        identity: &Identity,
        channel: ChannelId,
        filename: String,
        content: String,
    ) -> RelayResult<JoinHandle<()>> {
        let (session, agent) = self
            .registry
            .resolve(identity)
            .filter(|(_, agent)| agent.id() == channel)
            .ok_or_else(|| RelayError::Protocol("file-data before connect".to_string()))?;

        let checked = match self.state.params(session).await? {
            Some(params) => self
                .validator
                .validate(&filename, &content)
                .map(|file| (params, file)),
            None => Err(ValidationError::SessionNotStarted),
        };
        let (params, file) = match checked {
            Ok(ok) => ok,
            Err(e) => {
                self.reject(identity, session, &agent, &filename, &e).await;
                return Err(e.into());
            }
        };

        if let Some(adjust) = self.flow.observe(identity, self.dispatcher.load()) {
            agent
                .send(ServerMessage::AdjustSendRate {
                    interval_seconds: adjust.interval_seconds,
                    reason: adjust.reason,
                })
                .await?;
        }

        let now = Instant::now();
        let pending = PendingAck {
            filename: filename.clone(),
            session,
            sent_at: now,
            deadline: now + self.config.ack_timeout(),
        };
        if let Some(previous) = self.pending.insert(identity.clone(), pending) {
            tracing::warn!(
                identity = %identity,
                previous = %previous.filename,
                filename = %filename,
                "file arrived while another was pending"
            );
        }
        self.state.bump_progress(session, Progress::Received).await?;

        let frequency = file
            .name
            .frequency
            .or_else(|| params.frequencies.first().copied())
            .unwrap_or(0);
        let key = ResultKey::new(params.selected_electrode, frequency, file.name.index);
        let file_params = params.for_frequency(frequency);
        tracing::debug!(identity = %identity, filename = %filename, frequency, index = key.file_index, "file accepted");

        let hub = Arc::clone(self);
        let identity = identity.clone();
        Ok(tokio::spawn(async move {
            hub.process(identity, session, filename, content, file_params, key)
                .await;
        }))
    }

    async fn reject(
        &self,
        identity: &Identity,
        session: SessionId,
        agent: &ChannelHandle,
        filename: &str,
        error: &ValidationError,
    ) {
        tracing::warn!(identity = %identity, filename = %filename, "file rejected: {error}");
        if let Err(e) = self.state.bump_progress(session, Progress::Rejected).await {
            tracing::warn!(identity = %identity, "progress update failed: {e}");
        }
        if let Err(e) = self
            .state
            .add_warning(session, Some(filename), error.to_string())
            .await
        {
            tracing::warn!(identity = %identity, "warning log failed: {e}");
        }
        let message = ServerMessage::FileValidationError {
            filename: filename.to_string(),
            reason: error.to_string(),
        };
        self.viewers.broadcast(identity, &message);
        if let Err(e) = agent.send(message).await {
            tracing::warn!(identity = %identity, "validation reply lost: {e}");
        }
    }

    /// Analyze, record, fan out, acknowledge
    async fn process(
        self: Arc<Self>,
        identity: Identity,
        submitted_in: SessionId,
        filename: String,
        content: String,
        params: AnalysisParams,
        key: ResultKey,
    ) {
        let analyzer = Arc::clone(&self.analyzer);
        let result = self
            .dispatcher
            .submit_blocking(move || analyzer.analyze(&content, &params))
            .await
            .unwrap_or_else(|e| AnalysisResult::error(format!("analysis failed: {e}")));

        // the agent may have reconnected while the analyzer ran
        let session = self.registry.session_for(&identity).unwrap_or(submitted_in);
        if let Err(e) = self.record(&identity, session, &filename, key, &result).await {
            tracing::warn!(identity = %identity, filename = %filename, "result not recorded: {e}");
        }

        let ack = ServerMessage::FileProcessingComplete {
            filename: filename.clone(),
        };
        if self.acks.route(&identity, submitted_in, ack).await == AckOutcome::Dropped {
            tracing::debug!(identity = %identity, filename = %filename, "completion not delivered");
        }
        self.pending
            .remove_if(&identity, |_, pending| pending.filename == filename);
    }

    async fn record(
        &self,
        identity: &Identity,
        session: SessionId,
        filename: &str,
        key: ResultKey,
        result: &AnalysisResult,
    ) -> RelayResult<()> {
        let accumulated = AccumulatedResult {
            key,
            filename: filename.to_string(),
            result: result.clone(),
        };
        self.state.record_result(session, &accumulated).await?;
        let counter = if result.status.has_value() {
            Progress::Completed
        } else {
            Progress::Failed
        };
        self.state.bump_progress(session, counter).await?;
        if result.status != AnalysisStatus::Success {
            let message = result.message().unwrap_or("analysis reported a problem");
            self.state.add_warning(session, Some(filename), message).await?;
        }

        let (_, trends) = self.snapshot(session).await?;
        self.viewers.broadcast(
            identity,
            &ServerMessage::AnalysisUpdate {
                filename: filename.to_string(),
                result: result.clone(),
                electrode_index: key.electrode,
                trends,
            },
        );
        tracing::debug!(identity = %identity, filename = %filename, status = ?result.status, "result recorded");
        Ok(())
    }

    /// Accumulated results and trends for a session
    async fn snapshot(
        &self,
        session: SessionId,
    ) -> RelayResult<(Vec<AccumulatedResult>, Option<TrendReport>)> {
        let results = self.state.results(session).await?;
        let trends = self
            .state
            .params(session)
            .await?
            .and_then(|params| calculate_trends(&results, &params));
        Ok((results, trends))
    }

    /// Clear pending acks whose deadline has passed
    pub fn sweep_pending(&self) -> Vec<(Identity, PendingAck)> {
        let now = Instant::now();
        let expired: Vec<Identity> = self
            .pending
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.key().clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|identity| {
                self.pending
                    .remove_if(&identity, |_, p| p.deadline <= now)
                    .inspect(|(id, p)| {
                        tracing::warn!(identity = %id, filename = %p.filename, "ack deadline passed");
                    })
            })
            .collect()
    }

    /// Run [`sweep_pending`](Self::sweep_pending) periodically
    pub fn spawn_pending_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                hub.sweep_pending();
            }
        })
    }

    /// Stop admitting analysis work
    pub fn shutdown(&self) {
        self.dispatcher.close();
        tracing::info!("relay hub shutting down");
    }

    /// Turn a handler error into the reply the offending client should see
    #[must_use]
    pub fn error_reply(error: &RelayError) -> ServerMessage {
        ServerMessage::Error {
            message: error.client_reason(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::PeakCurrentAnalyzer;
    use crate::store::MemoryStore;
    use crate::types::FilterSpec;

    fn hub() -> Arc<RelayHub> {
        RelayHub::new(
            RelayConfig::default().with_capacity(2),
            Arc::new(MemoryStore::new()),
            Arc::new(PeakCurrentAnalyzer),
        )
    }

    const TRIANGLE: &str = "0.0 1e-6\n0.1 1e-6\n0.2 2.5e-6\n0.3 4e-6\n0.4 2.5e-6\n0.5 1e-6\n";

    #[tokio::test]
    async fn connect_assigns_session_and_notifies_viewers() {
        let hub = hub();
        let (viewer, mut viewer_rx) = hub.open_channel(ChannelRole::Viewer);
        hub.viewer_joined("lab", &viewer).await.unwrap();
        assert!(matches!(
            viewer_rx.recv().await,
            Some(ServerMessage::AgentStatus { connected: false, .. })
        ));
        assert!(matches!(
            viewer_rx.recv().await,
            Some(ServerMessage::HistoricalReplay { ref results, .. }) if results.is_empty()
        ));

        let (agent, mut agent_rx) = hub.open_channel(ChannelRole::Agent);
        let (_, session) = hub.agent_connected("lab", &agent).await.unwrap();
        assert_eq!(
            agent_rx.recv().await,
            Some(ServerMessage::SessionAssigned { session_id: session })
        );
        assert!(matches!(
            viewer_rx.recv().await,
            Some(ServerMessage::AgentStatus { connected: true, .. })
        ));
    }

    #[tokio::test]
    async fn invalid_identity_is_rejected() {
        let hub = hub();
        let (agent, mut rx) = hub.open_channel(ChannelRole::Agent);
        let err = hub.agent_connected("a:b", &agent).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Registry(RegistryError::InvalidIdentity(_))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::ConnectionRejected { .. })
        ));
    }

    #[tokio::test]
    async fn start_session_without_agent_acks_error() {
        let hub = hub();
        let (viewer, mut rx) = hub.open_channel(ChannelRole::Viewer);
        let err = hub
            .start_session(
                &Identity::new("lab"),
                &viewer,
                AnalysisParams::new(vec![10], 2),
                FilterSpec::new("h", 1, 2),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AgentNotConnected(_)));
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::SessionStartAck {
                status: AckStatus::Error,
                message: "Error: Local agent not detected.".into(),
            })
        );
    }

    #[tokio::test]
    async fn file_before_session_start_is_rejected_with_reply() {
        let hub = hub();
        let (agent, mut rx) = hub.open_channel(ChannelRole::Agent);
        let (identity, _) = hub.agent_connected("lab", &agent).await.unwrap();
        let _ = rx.recv().await;

        let err = hub
            .file_received(&identity, agent.id(), "h_10Hz_1.txt".into(), TRIANGLE.into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::Validation(ValidationError::SessionNotStarted)
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::FileValidationError { .. })
        ));
    }

    #[tokio::test]
    async fn accepted_file_is_analyzed_recorded_and_acked() {
        let hub = hub();
        let (agent, mut agent_rx) = hub.open_channel(ChannelRole::Agent);
        let (viewer, mut viewer_rx) = hub.open_channel(ChannelRole::Viewer);
        let (identity, session) = hub.agent_connected("lab", &agent).await.unwrap();
        hub.viewer_joined("lab", &viewer).await.unwrap();
        hub.start_session(
            &identity,
            &viewer,
            AnalysisParams::new(vec![10], 2),
            FilterSpec::new("h", 1, 2),
        )
        .await
        .unwrap();

        // session-assigned, set-filters
        let _ = agent_rx.recv().await;
        let Some(ServerMessage::SetFilters { filters }) = agent_rx.recv().await else {
            panic!("expected set-filters");
        };
        assert_eq!(filters.ack_timeout_secs, Some(60));
        assert_eq!(filters.file_extension, ".txt");
        assert_eq!(filters.max_file_bytes, Some(10 * 1024 * 1024));

        let task = hub
            .file_received(&identity, agent.id(), "h_10Hz_1.txt".into(), TRIANGLE.into())
            .await
            .unwrap();
        assert!(hub.pending_ack(&identity).is_some());
        task.await.unwrap();

        assert_eq!(
            agent_rx.recv().await,
            Some(ServerMessage::FileProcessingComplete {
                filename: "h_10Hz_1.txt".into()
            })
        );
        assert!(hub.pending_ack(&identity).is_none());

        let results = hub.state().results(session).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, ResultKey::new(None, 10, 1));

        // agent-status, replay, start ack, then the update
        let mut saw_update = false;
        while let Ok(msg) = viewer_rx.try_recv() {
            if let ServerMessage::AnalysisUpdate { trends, .. } = msg {
                assert!(trends.is_some());
                saw_update = true;
            }
        }
        assert!(saw_update);
    }

    #[tokio::test]
    async fn out_of_range_params_are_refused_before_anything_changes() {
        let hub = hub();
        let (agent, mut agent_rx) = hub.open_channel(ChannelRole::Agent);
        let (viewer, mut viewer_rx) = hub.open_channel(ChannelRole::Viewer);
        let (identity, session) = hub.agent_connected("lab", &agent).await.unwrap();
        let _ = agent_rx.recv().await;

        let err = hub
            .start_session(
                &identity,
                &viewer,
                AnalysisParams::new(vec![10, 20], u32::MAX),
                FilterSpec::new("h", 1, 2),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::Validation(ValidationError::ParamOutOfRange { name: "numFiles", .. })
        ));
        let Some(ServerMessage::SessionStartAck { status, message }) = viewer_rx.recv().await
        else {
            panic!("expected session-start-ack");
        };
        assert_eq!(status, AckStatus::Error);
        assert!(message.contains("numFiles"), "{message}");

        assert!(agent_rx.try_recv().is_err(), "no set-filters for a refused start");
        assert!(hub.state().params(session).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_during_reconnect_clears_the_migrated_results() {
        let hub = hub();
        let (old_agent, old_rx) = hub.open_channel(ChannelRole::Agent);
        let (identity, old_session) = hub.agent_connected("lab", &old_agent).await.unwrap();
        hub.state()
            .record_result(
                old_session,
                &AccumulatedResult {
                    key: ResultKey::new(None, 10, 1),
                    filename: "h_10Hz_1.txt".into(),
                    result: AnalysisResult::success(4.0),
                },
            )
            .await
            .unwrap();
        drop(old_rx);

        // hold the identity while the reconnect and the new start queue up
        let guard = hub.registry().lock_session(&identity).await;
        let (new_agent, _new_rx) = hub.open_channel(ChannelRole::Agent);
        let reconnect = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.agent_connected("lab", &new_agent).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let (viewer, _viewer_rx) = hub.open_channel(ChannelRole::Viewer);
        let start = tokio::spawn({
            let hub = Arc::clone(&hub);
            let identity = identity.clone();
            async move {
                hub.start_session(
                    &identity,
                    &viewer,
                    AnalysisParams::new(vec![10], 2),
                    FilterSpec::new("h", 1, 2),
                )
                .await
            }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(guard);

        let (_, new_session) = reconnect.await.unwrap().unwrap();
        start.await.unwrap().unwrap();
        assert!(hub.state().results(new_session).await.unwrap().is_empty());
        assert!(hub.state().params(new_session).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_clears_expired_pending_acks() {
        let hub = hub();
        let identity = Identity::new("lab");
        let now = Instant::now();
        hub.pending.insert(
            identity.clone(),
            PendingAck {
                filename: "h_10Hz_1.txt".into(),
                session: SessionId::new(),
                sent_at: now,
                deadline: now + Duration::from_secs(60),
            },
        );
        assert!(hub.sweep_pending().is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        let swept = hub.sweep_pending();
        assert_eq!(swept.len(), 1);
        assert!(hub.pending_ack(&identity).is_none());
    }
}
