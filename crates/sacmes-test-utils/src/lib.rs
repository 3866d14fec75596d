//! Testing utilities for the SACMES workspace
//!
//! Scripted analyzers, hub fixtures and channel helpers.

#![allow(missing_docs)]

use parking_lot::{Condvar, Mutex};
use sacmes_core::{
    AnalysisParams, AnalysisResult, Analyzer, ChannelHandle, ChannelRole, FilterSpec, Identity,
    MemoryStore, RelayConfig, RelayHub, ServerMessage, SessionId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Triangle peak of 3 µA at 0.3 V
pub const SAMPLE_FILE: &str = "0.0 1e-6\n0.1 1e-6\n0.2 2.5e-6\n0.3 4e-6\n0.4 2.5e-6\n0.5 1e-6\n";

/// Returns a fixed value
#[derive(Debug, Clone, Copy)]
pub struct FixedAnalyzer(pub f64);

impl Analyzer for FixedAnalyzer {
    fn analyze(&self, _raw: &str, _params: &AnalysisParams) -> AnalysisResult {
        AnalysisResult::success(self.0)
    }
}

/// Always panics
#[derive(Debug, Clone, Copy)]
pub struct PanickingAnalyzer;

impl Analyzer for PanickingAnalyzer {
    fn analyze(&self, _raw: &str, _params: &AnalysisParams) -> AnalysisResult {
        panic!("analyzer blew up")
    }
}

/// Blocks every call until [`GatedAnalyzer::release`]
#[derive(Debug, Default)]
pub struct GatedAnalyzer {
    open: Mutex<bool>,
    opened: Condvar,
    started: AtomicUsize,
}

impl GatedAnalyzer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let every waiting and future call through
    pub fn release(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    /// Calls that have entered `analyze`
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Wait (in real time) until `n` calls have entered `analyze`
    pub async fn wait_started(&self, n: usize) {
        while self.started() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl Analyzer for GatedAnalyzer {
    fn analyze(&self, _raw: &str, _params: &AnalysisParams) -> AnalysisResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        AnalysisResult::success(1.0)
    }
}

/// Sleeps for a fixed time and records peak concurrency
#[derive(Debug)]
pub struct CountingAnalyzer {
    work: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingAnalyzer {
    pub fn new(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Analyzer for CountingAnalyzer {
    fn analyze(&self, _raw: &str, _params: &AnalysisParams) -> AnalysisResult {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.work);
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        AnalysisResult::success(1.0)
    }
}

/// Config with a small dispatcher
pub fn test_config(capacity: usize) -> RelayConfig {
    RelayConfig::default().with_capacity(capacity)
}

/// Hub over an in-process store
pub fn test_hub(config: RelayConfig, analyzer: Arc<dyn Analyzer>) -> Arc<RelayHub> {
    RelayHub::new(config, Arc::new(MemoryStore::new()), analyzer)
}

pub fn sample_params() -> AnalysisParams {
    AnalysisParams::new(vec![10, 20], 4)
}

pub fn sample_filters() -> FilterSpec {
    FilterSpec::new("h", 1, 4).with_frequencies(vec![10, 20])
}

/// One connected agent as the transport would hold it
#[derive(Debug)]
pub struct TestAgent {
    pub identity: Identity,
    pub session: SessionId,
    pub channel: ChannelHandle,
    pub rx: mpsc::Receiver<ServerMessage>,
}

/// Open an agent channel and send `connect`, consuming `session-assigned`
pub async fn connect_agent(hub: &Arc<RelayHub>, identity: &str) -> TestAgent {
    let (channel, mut rx) = hub.open_channel(ChannelRole::Agent);
    let (identity, session) = hub
        .agent_connected(identity, &channel)
        .await
        .expect("agent registers");
    let assigned = rx.recv().await;
    assert_eq!(
        assigned,
        Some(ServerMessage::SessionAssigned {
            session_id: session
        })
    );
    TestAgent {
        identity,
        session,
        channel,
        rx,
    }
}

/// One joined viewer
#[derive(Debug)]
pub struct TestViewer {
    pub identity: Identity,
    pub channel: ChannelHandle,
    pub rx: mpsc::Receiver<ServerMessage>,
}

/// Open a viewer channel and join `identity`, consuming status and replay
pub async fn join_viewer(hub: &Arc<RelayHub>, identity: &str) -> (TestViewer, Vec<ServerMessage>) {
    let (channel, mut rx) = hub.open_channel(ChannelRole::Viewer);
    let identity = hub
        .viewer_joined(identity, &channel)
        .await
        .expect("viewer joins");
    let greeting = vec![
        rx.recv().await.expect("agent-status"),
        rx.recv().await.expect("historical-replay"),
    ];
    (
        TestViewer {
            identity,
            channel,
            rx,
        },
        greeting,
    )
}

/// Everything currently queued on a receiver
pub fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

/// Receive until `pred` matches, skipping other messages; `None` on timeout
pub async fn recv_matching<F>(
    rx: &mut mpsc::Receiver<ServerMessage>,
    within: Duration,
    mut pred: F,
) -> Option<ServerMessage>
where
    F: FnMut(&ServerMessage) -> bool,
{
    tokio::time::timeout(within, async {
        while let Some(msg) = rx.recv().await {
            if pred(&msg) {
                return Some(msg);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Analysis params with analyzer-specific extras
pub fn params_with(extra: serde_json::Value) -> AnalysisParams {
    let mut params = sample_params();
    if let serde_json::Value::Object(map) = extra {
        params.extra = map;
    }
    params
}
