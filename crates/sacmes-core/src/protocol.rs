//! Wire protocol between agents, viewers and the relay
//!
//! Every frame is a JSON object tagged by `type`. Field names are camelCase.

use crate::trends::TrendReport;
use crate::types::{
    AccumulatedResult, AnalysisParams, AnalysisResult, FilterSpec, Identity, SessionId,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Agent -> server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentMessage {
    /// First frame on a new agent connection
    Connect {
        /// Durable agent identity
        identity: String,
    },
    /// One measurement file
    FileData {
        /// Base filename
        filename: String,
        /// Raw text content
        content: String,
    },
}

/// Viewer -> server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ViewerMessage {
    /// Subscribe to one identity's session
    JoinMonitor {
        /// Identity to monitor
        identity: String,
    },
    /// Start (or restart) analysis for the monitored identity
    #[serde(rename_all = "camelCase")]
    StartSession {
        /// Parameters for the analyzer and trend axis
        analysis_params: AnalysisParams,
        /// Filters forwarded to the agent
        filters: FilterSpec,
    },
    /// Ask the monitored agent to stop sending
    StopSession,
}

/// Server -> agent or viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Agent accepted
    #[serde(rename_all = "camelCase")]
    SessionAssigned {
        /// Fresh session id for this connection
        session_id: SessionId,
    },
    /// Agent refused; the connection closes afterwards
    ConnectionRejected {
        /// Why
        reason: String,
    },
    /// Agent presence change for a monitored identity
    AgentStatus {
        /// Identity concerned
        identity: Identity,
        /// Whether a live agent holds it
        connected: bool,
    },
    /// Current accumulated results, sent on join
    HistoricalReplay {
        /// Identity concerned
        identity: Identity,
        /// Every value accumulated so far
        results: Vec<AccumulatedResult>,
        /// Trends over those values, when params are known
        trends: Option<TrendReport>,
    },
    /// New filter set for the agent's scan
    SetFilters {
        /// Filters to apply
        filters: FilterSpec,
    },
    /// Acknowledgment that a file has been handled (any outcome)
    FileProcessingComplete {
        /// File being acknowledged
        filename: String,
    },
    /// Flow-control instruction
    #[serde(rename_all = "camelCase")]
    AdjustSendRate {
        /// Pause between files, already clamped
        interval_seconds: f64,
        /// Why the rate changed
        reason: String,
    },
    /// Abort the remaining send queue
    Stop,
    /// One new analysis result for viewers
    #[serde(rename_all = "camelCase")]
    AnalysisUpdate {
        /// Source filename
        filename: String,
        /// Analyzer output
        result: AnalysisResult,
        /// Electrode analyzed; `None` for the average
        electrode_index: Option<u32>,
        /// Recomputed trends
        trends: Option<TrendReport>,
    },
    /// File refused before analysis
    FileValidationError {
        /// File refused
        filename: String,
        /// Why
        reason: String,
    },
    /// Reply to a viewer's start-session
    SessionStartAck {
        /// `success` or `error`
        status: AckStatus,
        /// Human-readable detail
        message: String,
    },
    /// Generic error for malformed frames
    Error {
        /// What went wrong
        message: String,
    },
}

impl ServerMessage {
    /// Short event name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionAssigned { .. } => "session-assigned",
            Self::ConnectionRejected { .. } => "connection-rejected",
            Self::AgentStatus { .. } => "agent-status",
            Self::HistoricalReplay { .. } => "historical-replay",
            Self::SetFilters { .. } => "set-filters",
            Self::FileProcessingComplete { .. } => "file-processing-complete",
            Self::AdjustSendRate { .. } => "adjust-send-rate",
            Self::Stop => "stop",
            Self::AnalysisUpdate { .. } => "analysis-update",
            Self::FileValidationError { .. } => "file-validation-error",
            Self::SessionStartAck { .. } => "session-start-ack",
            Self::Error { .. } => "error",
        }
    }
}

/// Status of a session-start acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Instructions sent to the agent
    Success,
    /// Nothing sent
    Error,
}

static FREQUENCY_AND_INDEX: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)_(\d+)Hz_?_?(\d+)\.").unwrap()
});

static INDEX_ONLY: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"_(\d+)\.[^.]+$").unwrap()
});

/// Frequency tag and file index parsed from a measurement filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeasurementName {
    /// Frequency in Hz, when the name carries a `_<n>Hz` tag
    pub frequency: Option<u32>,
    /// Numeric file index
    pub index: u32,
}

impl MeasurementName {
    /// Parse `<prefix>_<freq>Hz_<index>.<ext>` or `<prefix>_<index>.<ext>`
    #[must_use]
    pub fn parse(filename: &str) -> Option<Self> {
        if let Some(caps) = FREQUENCY_AND_INDEX.captures(filename) {
            let frequency = caps.get(1)?.as_str().parse().ok()?;
            let index = caps.get(2)?.as_str().parse().ok()?;
            return Some(Self {
                frequency: Some(frequency),
                index,
            });
        }
        let caps = INDEX_ONLY.captures(filename)?;
        let index = caps.get(1)?.as_str().parse().ok()?;
        Some(Self {
            frequency: None,
            index,
        })
    }
}

/// Extension of a filename including the leading dot, lowercased
#[must_use]
pub fn extension_of(filename: &str) -> Option<String> {
    let dot = filename.rfind('.')?;
    let ext = &filename[dot..];
    (ext.len() > 1).then(|| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_frequency_and_index() {
        let name = MeasurementName::parse("h_10Hz_2.txt").unwrap();
        assert_eq!(name.frequency, Some(10));
        assert_eq!(name.index, 2);

        let name = MeasurementName::parse("EXP_250hz__14.DTA").unwrap();
        assert_eq!(name.frequency, Some(250));
        assert_eq!(name.index, 14);

        let name = MeasurementName::parse("run_20Hz7.txt").unwrap();
        assert_eq!(name.index, 7);
    }

    #[test]
    fn parse_index_only() {
        let name = MeasurementName::parse("cv_scan_3.csv").unwrap();
        assert_eq!(name.frequency, None);
        assert_eq!(name.index, 3);
        assert!(MeasurementName::parse("notes.txt").is_none());
        assert!(MeasurementName::parse("noext_4").is_none());
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension_of("a_1.TXT"), Some(".txt".to_string()));
        assert_eq!(extension_of("archive.tar.gz"), Some(".gz".to_string()));
        assert_eq!(extension_of("trailing."), None);
        assert_eq!(extension_of("none"), None);
    }

    #[test]
    fn server_messages_use_kebab_tags_and_camel_fields() {
        let msg = ServerMessage::AdjustSendRate {
            interval_seconds: 2.0,
            reason: "server busy".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "adjust-send-rate");
        assert_eq!(json["intervalSeconds"], 2.0);
        assert_eq!(msg.kind(), "adjust-send-rate");

        let stop = serde_json::to_value(&ServerMessage::Stop).unwrap();
        assert_eq!(stop, serde_json::json!({ "type": "stop" }));
    }

    #[test]
    fn agent_messages_parse_from_wire() {
        let raw = r#"{"type":"file-data","filename":"h_10Hz_1.txt","content":"1,2"}"#;
        let msg: AgentMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            AgentMessage::FileData {
                filename: "h_10Hz_1.txt".into(),
                content: "1,2".into(),
            }
        );
    }

    #[test]
    fn viewer_start_session_parses() {
        let raw = serde_json::json!({
            "type": "start-session",
            "analysisParams": { "frequencies": [10, 20], "numFiles": 4 },
            "filters": { "handle": "h", "rangeStart": 1, "rangeEnd": 4 }
        });
        let msg: ViewerMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ViewerMessage::StartSession {
                analysis_params,
                filters,
            } => {
                assert_eq!(analysis_params.num_files, 4);
                assert_eq!(filters.handle, "h");
                assert_eq!(filters.file_extension, ".txt");
            }
            other => panic!("expected StartSession, got {other:?}"),
        }
    }
}
