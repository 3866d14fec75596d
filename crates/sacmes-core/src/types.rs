//! Core types for the relay
//!
//! Defines the fundamental types shared by server and agent:
//! - Identities, sessions and channel ids
//! - Analysis parameters and filter specifications
//! - Analysis results and the keys they are accumulated under

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ulid::Ulid;

/// Durable, client-generated agent identifier
///
/// Survives agent restarts; one per physical installation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Longest identity accepted on the wire
    pub const MAX_LEN: usize = 128;

    /// Wrap a raw identifier
    #[inline]
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Parse an identifier received from a client
    ///
    /// Rejects empty values, overlong values and characters that would
    /// break store key namespacing.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > Self::MAX_LEN {
            return None;
        }
        let valid = trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        valid.then(|| Self(trimmed.to_string()))
    }

    /// Raw string form
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-generated session id (ULID for sortability)
///
/// A fresh one is minted on every agent connection, including reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Generate new session ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique id of one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub Ulid);

impl ChannelId {
    /// Generate new channel ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the relay a channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Instrument-side producer
    Agent,
    /// Browser-side monitor
    Viewer,
}

/// Analysis parameters chosen by a viewer for one session
///
/// Analyzer-specific settings that the relay does not interpret travel in
/// `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisParams {
    /// Frequencies (Hz) under analysis
    #[serde(default)]
    pub frequencies: Vec<u32>,
    /// Number of file positions on the trend axis
    #[serde(default = "default_num_files")]
    pub num_files: u32,
    /// 1-based file position used as the normalization reference
    #[serde(default = "default_normalization_point")]
    pub normalization_point: u32,
    /// File extension the instrument writes (with leading dot)
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    /// Electrode to analyze; `None` averages all electrodes
    #[serde(default)]
    pub selected_electrode: Option<u32>,
    /// Frequency injected per file by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
    /// Analyzer-specific settings
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_num_files() -> u32 {
    1
}

fn default_normalization_point() -> u32 {
    1
}

fn default_file_extension() -> String {
    ".txt".to_string()
}

impl AnalysisParams {
    /// Create params for a frequency set
    #[must_use]
    pub fn new(frequencies: Vec<u32>, num_files: u32) -> Self {
        Self {
            frequencies,
            num_files,
            ..Self::default()
        }
    }

    /// With normalization point
    #[inline]
    #[must_use]
    pub fn with_normalization_point(mut self, point: u32) -> Self {
        self.normalization_point = point;
        self
    }

    /// With selected electrode
    #[inline]
    #[must_use]
    pub fn with_electrode(mut self, electrode: u32) -> Self {
        self.selected_electrode = Some(electrode);
        self
    }

    /// Copy of these params specialised for one file's frequency
    #[must_use]
    pub fn for_frequency(&self, frequency: u32) -> Self {
        let mut params = self.clone();
        params.frequency = Some(frequency);
        params
    }

    /// Numeric analyzer setting from `extra`, if present and numeric
    #[must_use]
    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(serde_json::Value::as_f64)
    }
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            frequencies: Vec::new(),
            num_files: default_num_files(),
            normalization_point: default_normalization_point(),
            file_extension: default_file_extension(),
            selected_electrode: None,
            frequency: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// File filter sent to an agent with `set-filters`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    /// Required filename prefix
    pub handle: String,
    /// Frequencies to accept; empty accepts any (or no) frequency tag
    #[serde(default)]
    pub frequencies: Vec<u32>,
    /// First file index accepted (inclusive)
    pub range_start: u32,
    /// Last file index accepted (inclusive)
    pub range_end: u32,
    /// Required extension (with leading dot)
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    /// Seconds the agent waits for an acknowledgment before moving on
    #[serde(default)]
    pub ack_timeout_secs: Option<u64>,
    /// Initial pause between files, in seconds
    #[serde(default)]
    pub send_interval_secs: Option<f64>,
    /// Largest file the relay accepts; larger files are not sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_bytes: Option<u64>,
}

impl FilterSpec {
    /// Create a filter for a prefix and index range
    #[must_use]
    pub fn new(handle: impl Into<String>, range_start: u32, range_end: u32) -> Self {
        Self {
            handle: handle.into(),
            frequencies: Vec::new(),
            range_start,
            range_end,
            file_extension: default_file_extension(),
            ack_timeout_secs: None,
            send_interval_secs: None,
            max_file_bytes: None,
        }
    }

    /// With frequency set
    #[inline]
    #[must_use]
    pub fn with_frequencies(mut self, frequencies: Vec<u32>) -> Self {
        self.frequencies = frequencies;
        self
    }

    /// With extension
    #[inline]
    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }
}

/// Outcome class reported by the analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    /// Value computed
    Success,
    /// Value computed (or absent) with a recoverable problem
    Warning,
    /// No value; the input could not be analyzed
    Error,
}

impl AnalysisStatus {
    /// Whether the result carries a usable value
    #[inline]
    #[must_use]
    pub fn has_value(self) -> bool {
        matches!(self, Self::Success | Self::Warning)
    }
}

/// Result of analyzing one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Outcome class
    pub status: AnalysisStatus,
    /// Peak value (meaningless when `status` is `Error`)
    pub value: f64,
    /// Free-form analyzer metadata (messages, fit details)
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AnalysisResult {
    /// Successful result
    #[must_use]
    pub fn success(value: f64) -> Self {
        Self {
            status: AnalysisStatus::Success,
            value,
            metadata: BTreeMap::new(),
        }
    }

    /// Warning result with message
    #[must_use]
    pub fn warning(value: f64, message: impl Into<String>) -> Self {
        Self::success(value)
            .with_status(AnalysisStatus::Warning)
            .with_meta("message", message.into())
    }

    /// Error result with message
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::success(0.0)
            .with_status(AnalysisStatus::Error)
            .with_meta("message", message.into())
    }

    /// Override status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: AnalysisStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach metadata entry
    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Human-readable message, if the analyzer left one
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.metadata.get("message").and_then(serde_json::Value::as_str)
    }
}

/// Coordinates of one accumulated value: (electrode, frequency, file index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultKey {
    /// Electrode index; `None` for the electrode average
    pub electrode: Option<u32>,
    /// Frequency in Hz
    pub frequency: u32,
    /// File index parsed from the filename
    pub file_index: u32,
}

impl ResultKey {
    /// Create key
    #[inline]
    #[must_use]
    pub fn new(electrode: Option<u32>, frequency: u32, file_index: u32) -> Self {
        Self {
            electrode,
            frequency,
            file_index,
        }
    }

    /// Store key segment, e.g. `avg:20:3` or `e2:20:3`
    #[must_use]
    pub fn to_segment(&self) -> String {
        match self.electrode {
            Some(e) => format!("e{e}:{}:{}", self.frequency, self.file_index),
            None => format!("avg:{}:{}", self.frequency, self.file_index),
        }
    }

    /// Parse a segment produced by [`ResultKey::to_segment`]
    #[must_use]
    pub fn from_segment(segment: &str) -> Option<Self> {
        let mut parts = segment.split(':');
        let electrode = match parts.next()? {
            "avg" => None,
            e => Some(e.strip_prefix('e')?.parse().ok()?),
        };
        let frequency = parts.next()?.parse().ok()?;
        let file_index = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(electrode, frequency, file_index))
    }
}

/// One accumulated value as replayed to viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatedResult {
    /// Where the value sits
    pub key: ResultKey,
    /// Source filename
    pub filename: String,
    /// The analyzer's result
    pub result: AnalysisResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_parse_rejects_bad_input() {
        assert!(Identity::parse("").is_none());
        assert!(Identity::parse("   ").is_none());
        assert!(Identity::parse("a:b").is_none());
        assert!(Identity::parse(&"x".repeat(200)).is_none());
        assert_eq!(
            Identity::parse(" lab-3_agent.01 ").map(|i| i.to_string()),
            Some("lab-3_agent.01".to_string())
        );
    }

    #[test]
    fn result_key_segment_roundtrip() {
        let avg = ResultKey::new(None, 20, 3);
        assert_eq!(avg.to_segment(), "avg:20:3");
        assert_eq!(ResultKey::from_segment("avg:20:3"), Some(avg));

        let e2 = ResultKey::new(Some(2), 100, 12);
        assert_eq!(ResultKey::from_segment(&e2.to_segment()), Some(e2));

        assert!(ResultKey::from_segment("x:1:2").is_none());
        assert!(ResultKey::from_segment("avg:1:2:3").is_none());
    }

    #[test]
    fn analysis_params_keep_unknown_fields() {
        let json = serde_json::json!({
            "frequencies": [10, 20],
            "numFiles": 5,
            "low_xstart": 0.1
        });
        let params: AnalysisParams = serde_json::from_value(json).unwrap();
        assert_eq!(params.frequencies, vec![10, 20]);
        assert_eq!(params.num_files, 5);
        assert_eq!(params.normalization_point, 1);
        assert_eq!(params.extra_f64("low_xstart"), Some(0.1));

        let per_file = params.for_frequency(20);
        assert_eq!(per_file.frequency, Some(20));
    }

    #[test]
    fn analysis_status_value_classes() {
        assert!(AnalysisStatus::Success.has_value());
        assert!(AnalysisStatus::Warning.has_value());
        assert!(!AnalysisStatus::Error.has_value());
        assert_eq!(AnalysisResult::error("bad").message(), Some("bad"));
    }
}
