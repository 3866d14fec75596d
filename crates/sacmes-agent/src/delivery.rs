//! Serialized, acknowledgment-paced send loop
//!
//! At most one file is in flight. After each send the loop waits for the
//! server's terminal response for that file (`file-processing-complete` or
//! `file-validation-error`) or for the ack timeout, whichever comes first.
//! A file is marked delivered as soon as it has been sent, so a timeout
//! never leads to a second copy. Files larger than the relay's advertised
//! limit are never sent; they are reported and marked delivered.

use crate::config::DeliverySettings;
use crate::error::{AgentError, AgentResult};
use crate::filter::FilterSet;
use crate::plan::plan_delivery;
use async_trait::async_trait;
use sacmes_core::{clamp_interval, AgentMessage, FilterSpec, ServerMessage};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// Server instruction relevant to the send loop
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// New filter set; resets the delivered set and restarts scanning
    Filters(FilterSpec),
    /// `file-processing-complete`
    Ack(String),
    /// `file-validation-error`
    Rejected {
        /// File refused
        filename: String,
        /// Why
        reason: String,
    },
    /// `adjust-send-rate`
    AdjustRate {
        /// Requested pause, clamped on receipt
        interval_seconds: f64,
        /// Why
        reason: String,
    },
    /// `stop`: abandon the remaining queue until new filters arrive
    Stop,
}

impl Control {
    /// Extract the loop-relevant part of a server message
    #[must_use]
    pub fn from_server(msg: ServerMessage) -> Option<Self> {
        match msg {
            ServerMessage::SetFilters { filters } => Some(Self::Filters(filters)),
            ServerMessage::FileProcessingComplete { filename } => Some(Self::Ack(filename)),
            ServerMessage::FileValidationError { filename, reason } => {
                Some(Self::Rejected { filename, reason })
            }
            ServerMessage::AdjustSendRate {
                interval_seconds,
                reason,
            } => Some(Self::AdjustRate {
                interval_seconds,
                reason,
            }),
            ServerMessage::Stop => Some(Self::Stop),
            _ => None,
        }
    }
}

/// Where files go
#[async_trait]
pub trait FileSink: Send {
    /// Hand one file to the transport
    async fn send_file(&mut self, filename: &str, content: String) -> AgentResult<()>;
}

#[async_trait]
impl FileSink for mpsc::Sender<AgentMessage> {
    async fn send_file(&mut self, filename: &str, content: String) -> AgentResult<()> {
        self.send(AgentMessage::FileData {
            filename: filename.to_string(),
            content,
        })
        .await
        .map_err(|_| AgentError::Closed)
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every planned file was handled
    #[default]
    Completed,
    /// Server sent `stop`
    Stopped,
    /// New filters arrived mid-run
    Refiltered,
    /// Control stream ended
    Disconnected,
    /// The sink refused a file
    SinkFailed,
}

/// What one run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    /// Files handed to the sink, in order
    pub sent: Vec<String>,
    /// Files the server acknowledged
    pub acknowledged: Vec<String>,
    /// Files the server refused
    pub rejected: Vec<String>,
    /// Files whose acknowledgment never came
    pub timed_out: Vec<String>,
    /// Files over the relay's size limit, not sent
    pub oversize: Vec<String>,
    /// How the run ended
    pub outcome: RunOutcome,
}

/// Agent-side delivery state, kept across reconnects
#[derive(Debug)]
pub struct DeliveryLoop {
    dir: PathBuf,
    settings: DeliverySettings,
    filters: Option<FilterSet>,
    ack_timeout: Duration,
    interval_secs: f64,
    max_file_bytes: Option<u64>,
    delivered: HashSet<String>,
    stopped: bool,
}

impl DeliveryLoop {
    /// Idle loop over `dir`; nothing is sent until filters arrive
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, settings: DeliverySettings) -> Self {
        Self {
            dir: dir.into(),
            ack_timeout: settings.ack_timeout,
            interval_secs: settings.send_interval_secs,
            settings,
            filters: None,
            max_file_bytes: None,
            delivered: HashSet::new(),
            stopped: false,
        }
    }

    /// Watched directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Install a filter set from `set-filters`
    pub fn apply_filters(&mut self, spec: &FilterSpec) {
        self.filters = Some(FilterSet::new(spec));
        self.max_file_bytes = spec.max_file_bytes;
        self.delivered.clear();
        self.stopped = false;
        self.ack_timeout = spec
            .ack_timeout_secs
            .map_or(self.settings.ack_timeout, Duration::from_secs);
        let interval = spec
            .send_interval_secs
            .unwrap_or(self.settings.send_interval_secs);
        self.set_interval(interval);
        tracing::info!(
            handle = %spec.handle,
            range_start = spec.range_start,
            range_end = spec.range_end,
            ack_timeout_secs = self.ack_timeout.as_secs(),
            max_file_bytes = ?self.max_file_bytes,
            "filters applied"
        );
    }

    /// Apply a server-chosen interval, clamped to the configured bounds
    pub fn set_interval(&mut self, seconds: f64) -> f64 {
        self.interval_secs = clamp_interval(
            seconds,
            self.settings.min_interval_secs,
            self.settings.max_interval_secs,
        );
        self.interval_secs
    }

    /// Current pause between files
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    /// Current acknowledgment timeout
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Whether `filename` has been sent under the current filters
    #[must_use]
    pub fn is_delivered(&self, filename: &str) -> bool {
        self.delivered.contains(filename)
    }

    /// Size limit advertised by the relay
    #[must_use]
    pub fn max_file_bytes(&self) -> Option<u64> {
        self.max_file_bytes
    }

    /// Whether a `stop` is in effect
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Matching, not yet delivered files in delivery order
    pub async fn scan(&self) -> AgentResult<Vec<String>> {
        let Some(filters) = self.filters.as_ref().filter(|_| !self.stopped) else {
            return Ok(Vec::new());
        };
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| AgentError::io(&self.dir, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AgentError::io(&self.dir, e))?
        {
            let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
            if !is_file {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                if !self.delivered.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(plan_delivery(names, filters))
    }

    // Non-file instruction; returns an outcome when the run must end
    fn absorb(&mut self, control: Control) -> Option<RunOutcome> {
        match control {
            Control::Filters(spec) => {
                self.apply_filters(&spec);
                Some(RunOutcome::Refiltered)
            }
            Control::Stop => {
                tracing::info!("stop received, abandoning queue");
                self.stopped = true;
                Some(RunOutcome::Stopped)
            }
            Control::AdjustRate {
                interval_seconds,
                reason,
            } => {
                let applied = self.set_interval(interval_seconds);
                tracing::info!(requested = interval_seconds, applied, %reason, "send rate adjusted");
                None
            }
            Control::Ack(filename) | Control::Rejected { filename, .. } => {
                tracing::debug!(filename = %filename, "stale response ignored");
                None
            }
        }
    }

    // True when the file was set aside for exceeding the relay's limit
    fn set_aside_if_oversize(&mut self, filename: &str, size: u64, report: &mut DeliveryReport) -> bool {
        let Some(limit) = self.max_file_bytes.filter(|limit| size > *limit) else {
            return false;
        };
        tracing::warn!(filename = %filename, size, limit, "file exceeds the relay's size limit, not sent");
        self.delivered.insert(filename.to_string());
        report.oversize.push(filename.to_string());
        true
    }

    async fn pause(&mut self, control: &mut mpsc::Receiver<Control>) -> Option<RunOutcome> {
        let until = Instant::now() + self.interval();
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(until) => return None,
                msg = control.recv() => match msg {
                    None => return Some(RunOutcome::Disconnected),
                    Some(msg) => {
                        if let Some(outcome) = self.absorb(msg) {
                            return Some(outcome);
                        }
                    }
                },
            }
        }
    }

    async fn await_response(
        &mut self,
        filename: &str,
        control: &mut mpsc::Receiver<Control>,
        report: &mut DeliveryReport,
    ) -> Option<RunOutcome> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(filename = %filename, timeout = ?self.ack_timeout, "no acknowledgment, moving on");
                    report.timed_out.push(filename.to_string());
                    return None;
                }
                msg = control.recv() => match msg {
                    None => return Some(RunOutcome::Disconnected),
                    Some(Control::Ack(name)) if name == filename => {
                        tracing::debug!(filename = %filename, "acknowledged");
                        report.acknowledged.push(name);
                        return None;
                    }
                    Some(Control::Rejected { filename: name, reason }) if name == filename => {
                        tracing::warn!(filename = %filename, %reason, "server rejected file");
                        report.rejected.push(name);
                        return None;
                    }
                    Some(other) => {
                        if let Some(outcome) = self.absorb(other) {
                            return Some(outcome);
                        }
                    }
                },
            }
        }
    }

    /// Send `files` in order, one at a time
    ///
    /// Files already delivered are skipped. A send failure, `stop`, new
    /// filters or a lost control stream end the run early; the files not
    /// yet sent stay undelivered.
    pub async fn run<S>(
        &mut self,
        files: Vec<String>,
        sink: &mut S,
        control: &mut mpsc::Receiver<Control>,
    ) -> DeliveryReport
    where
        S: FileSink + ?Sized,
    {
        let mut report = DeliveryReport::default();
        for filename in files {
            if self.delivered.contains(&filename) {
                continue;
            }
            if !report.sent.is_empty() {
                if let Some(outcome) = self.pause(control).await {
                    report.outcome = outcome;
                    return report;
                }
            }

            let path = self.dir.join(&filename);
            match tokio::fs::metadata(&path).await {
                Ok(meta) => {
                    if self.set_aside_if_oversize(&filename, meta.len(), &mut report) {
                        continue;
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "could not stat file: {e}");
                    continue;
                }
            }
            let content = match tokio::fs::read(&path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "could not read file: {e}");
                    continue;
                }
            };
            // the file may have grown, and lossy decoding can widen it
            if self.set_aside_if_oversize(&filename, content.len() as u64, &mut report) {
                continue;
            }
            if let Err(e) = sink.send_file(&filename, content).await {
                tracing::warn!(filename = %filename, "send failed: {e}");
                report.outcome = RunOutcome::SinkFailed;
                return report;
            }
            tracing::info!(filename = %filename, "sent");
            self.delivered.insert(filename.clone());
            report.sent.push(filename.clone());

            if let Some(outcome) = self.await_response(&filename, control, &mut report).await {
                report.outcome = outcome;
                return report;
            }
        }
        report
    }

    /// Scan, send and re-scan every poll interval until the connection ends
    pub async fn serve<S>(&mut self, sink: &mut S, control: &mut mpsc::Receiver<Control>) -> RunOutcome
    where
        S: FileSink + ?Sized,
    {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rescan = false;
        loop {
            if !rescan {
                tokio::select! {
                    msg = control.recv() => match msg {
                        None => return RunOutcome::Disconnected,
                        Some(msg) => {
                            self.absorb(msg);
                        }
                    },
                    _ = ticker.tick() => {}
                }
            }
            rescan = false;

            let files = match self.scan().await {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!("scan failed: {e}");
                    continue;
                }
            };
            if files.is_empty() {
                continue;
            }
            tracing::debug!(queued = files.len(), "delivery run starting");
            let report = self.run(files, sink, control).await;
            tracing::info!(
                sent = report.sent.len(),
                acknowledged = report.acknowledged.len(),
                rejected = report.rejected.len(),
                timed_out = report.timed_out.len(),
                oversize = report.oversize.len(),
                outcome = ?report.outcome,
                "delivery run finished"
            );
            match report.outcome {
                RunOutcome::Disconnected | RunOutcome::SinkFailed => return report.outcome,
                RunOutcome::Refiltered => rescan = true,
                RunOutcome::Completed | RunOutcome::Stopped => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_messages_map_to_controls() {
        assert_eq!(Control::from_server(ServerMessage::Stop), Some(Control::Stop));
        assert_eq!(
            Control::from_server(ServerMessage::FileProcessingComplete {
                filename: "a_1.txt".into()
            }),
            Some(Control::Ack("a_1.txt".into()))
        );
        assert_eq!(
            Control::from_server(ServerMessage::Error {
                message: "nope".into()
            }),
            None
        );
    }

    #[test]
    fn server_intervals_are_clamped() {
        let mut delivery = DeliveryLoop::new("/tmp", DeliverySettings::default());
        assert_eq!(delivery.set_interval(1_000.0), 30.0);
        assert_eq!(delivery.set_interval(0.0), 0.05);
        assert_eq!(delivery.set_interval(f64::NAN), 30.0);
        assert_eq!(delivery.set_interval(2.0), 2.0);
        assert_eq!(delivery.interval(), Duration::from_secs(2));
    }

    #[test]
    fn filters_reset_state_and_carry_timing() {
        let mut delivery = DeliveryLoop::new("/tmp", DeliverySettings::default());
        delivery.stopped = true;
        delivery.delivered.insert("h_10Hz_1.txt".into());

        let mut spec = FilterSpec::new("h", 1, 2);
        spec.ack_timeout_secs = Some(5);
        spec.send_interval_secs = Some(-3.0);
        delivery.apply_filters(&spec);

        assert!(!delivery.is_stopped());
        assert!(!delivery.is_delivered("h_10Hz_1.txt"));
        assert_eq!(delivery.ack_timeout(), Duration::from_secs(5));
        assert_eq!(delivery.interval(), Duration::from_secs_f64(0.05));
    }

    #[tokio::test]
    async fn nothing_is_scanned_before_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("h_10Hz_1.txt"), "1 2").unwrap();
        let delivery = DeliveryLoop::new(dir.path(), DeliverySettings::default());
        assert!(delivery.scan().await.unwrap().is_empty());
    }
}
