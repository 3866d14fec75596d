//! Relay configuration
//!
//! Layered: defaults, then an optional TOML file, then environment
//! variables. The server binary applies CLI flags last.

use crate::analyzer::MAX_ELECTRODES;
use crate::error::ConfigError;
use crate::trends::MAX_TREND_CELLS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address for the transport
    pub bind: String,
    /// Shared bearer token agents must present; `None` disables the check
    pub auth_token: Option<String>,
    /// Delay before a disconnect is treated as permanent
    pub grace_period_secs: u64,
    /// Ack timeout advertised to agents
    pub ack_timeout_secs: u64,
    /// Pause between pings on every socket
    pub heartbeat_secs: u64,
    /// Silence after which a socket is treated as dead
    pub liveness_timeout_secs: u64,
    /// Concurrent analysis slots
    pub dispatch_capacity: usize,
    /// Flow control thresholds and send intervals
    pub flow: FlowConfig,
    /// Inbound file limits
    pub validation: ValidationConfig,
    /// Bounds on viewer-supplied analysis parameters
    pub limits: SessionLimits,
    /// State store backend
    pub store: StoreConfig,
}

impl RelayConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With dispatcher capacity
    #[inline]
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_capacity = capacity;
        self
    }

    /// With grace period
    #[inline]
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_secs = grace.as_secs();
        self
    }

    /// With agent token
    #[inline]
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// With ping interval and silence timeout
    #[inline]
    #[must_use]
    pub fn with_heartbeat(mut self, every: Duration, timeout: Duration) -> Self {
        self.heartbeat_secs = every.as_secs();
        self.liveness_timeout_secs = timeout.as_secs();
        self
    }

    /// Ping interval as a duration
    #[inline]
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Silence timeout as a duration
    #[inline]
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Grace period as a duration
    #[inline]
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Ack timeout as a duration
    #[inline]
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SACMES_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("SACMES_BIND") {
            self.bind = bind;
        }
        if let Some(token) = lookup("SACMES_AUTH_TOKEN") {
            self.auth_token = (!token.is_empty()).then_some(token);
        }
        if let Some(url) = lookup("SACMES_STORE_URL") {
            self.store.url = (!url.is_empty()).then_some(url);
        }
        if let Some(raw) = lookup("SACMES_DISPATCH_CAPACITY") {
            self.dispatch_capacity = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "SACMES_DISPATCH_CAPACITY",
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch_capacity == 0 {
            return Err(ConfigError::Invalid("dispatch_capacity must be at least 1".into()));
        }
        if self.ack_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ack_timeout_secs must be at least 1".into()));
        }
        if self.heartbeat_secs == 0 || self.liveness_timeout_secs <= self.heartbeat_secs {
            return Err(ConfigError::Invalid(
                "liveness_timeout_secs must exceed a positive heartbeat_secs".into(),
            ));
        }
        self.flow.validate()?;
        if self.validation.max_file_bytes == 0 {
            return Err(ConfigError::Invalid("max_file_bytes must be positive".into()));
        }
        if self.validation.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid("allowed_extensions must not be empty".into()));
        }
        self.limits.validate()?;
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
            auth_token: None,
            grace_period_secs: 30,
            ack_timeout_secs: 60,
            heartbeat_secs: 15,
            liveness_timeout_secs: 45,
            dispatch_capacity: default_capacity(),
            flow: FlowConfig::default(),
            validation: ValidationConfig::default(),
            limits: SessionLimits::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Available CPU parallelism, falling back to 4
fn default_capacity() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

/// Flow controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Load above which agents are slowed
    pub high_watermark: f64,
    /// Load below which agents return to normal
    pub low_watermark: f64,
    /// Minimum time between adjustments for one identity
    pub min_adjust_interval_ms: u64,
    /// Normal pause between files
    pub normal_interval_secs: f64,
    /// Pause between files under load
    pub slow_interval_secs: f64,
    /// Smallest interval ever sent or accepted
    pub min_interval_secs: f64,
    /// Largest interval ever sent or accepted
    pub max_interval_secs: f64,
}

impl FlowConfig {
    /// Rate-limit window as a duration
    #[inline]
    #[must_use]
    pub fn min_adjust_interval(&self) -> Duration {
        Duration::from_millis(self.min_adjust_interval_ms)
    }

    /// Reject inverted thresholds or ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.low_watermark) || !(0.0..=1.0).contains(&self.high_watermark) {
            return Err(ConfigError::Invalid("watermarks must be within [0, 1]".into()));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(ConfigError::Invalid(
                "low_watermark must be below high_watermark".into(),
            ));
        }
        if self.min_interval_secs <= 0.0 || self.min_interval_secs > self.max_interval_secs {
            return Err(ConfigError::Invalid(
                "interval range must be positive and ordered".into(),
            ));
        }
        Ok(())
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.8,
            low_watermark: 0.3,
            min_adjust_interval_ms: 2000,
            normal_interval_secs: 0.1,
            slow_interval_secs: 2.0,
            min_interval_secs: 0.05,
            max_interval_secs: 30.0,
        }
    }
}

/// Inbound file limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Accepted extensions, lowercase with leading dot
    pub allowed_extensions: Vec<String>,
    /// Largest accepted content
    pub max_file_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: vec![".txt".into(), ".csv".into(), ".dta".into()],
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Largest analysis a viewer may request
///
/// Trend series are sized from these values, so they bound the memory one
/// session can claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Most file positions on the trend axis
    pub max_num_files: u32,
    /// Most frequencies in one session
    pub max_frequencies: usize,
    /// Most electrodes per file
    pub max_electrodes: u32,
}

impl SessionLimits {
    /// Reject zero limits and limits past what trends and the analyzer support
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_num_files == 0 || self.max_frequencies == 0 || self.max_electrodes == 0 {
            return Err(ConfigError::Invalid("session limits must be positive".into()));
        }
        let cells = (self.max_num_files as usize).saturating_mul(self.max_frequencies);
        if cells > MAX_TREND_CELLS {
            return Err(ConfigError::Invalid(format!(
                "max_num_files x max_frequencies must not exceed {MAX_TREND_CELLS}"
            )));
        }
        if self.max_electrodes as usize > MAX_ELECTRODES {
            return Err(ConfigError::Invalid(format!(
                "max_electrodes must not exceed {MAX_ELECTRODES}"
            )));
        }
        Ok(())
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_num_files: 10_000,
            max_frequencies: 32,
            max_electrodes: 64,
        }
    }
}

/// State store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Clustered store URL (e.g. `redis://host:6379`)
    pub url: Option<String>,
    /// Lifetime of session keys since their last write
    pub session_ttl_secs: u64,
}

impl StoreConfig {
    /// Session ttl as a duration
    #[inline]
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            session_ttl_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grace_period(), Duration::from_secs(30));
        assert_eq!(config.ack_timeout(), Duration::from_secs(60));
        assert!(config.liveness_timeout() > config.heartbeat());
        assert!(config.dispatch_capacity >= 1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "grace_period_secs = 5\n[flow]\nslow_interval_secs = 3.5\n[store]\nsession_ttl_secs = 90"
        )
        .unwrap();

        let config: RelayConfig =
            toml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(config.grace_period_secs, 5);
        assert_eq!(config.flow.slow_interval_secs, 3.5);
        assert_eq!(config.flow.high_watermark, 0.8);
        assert_eq!(config.store.session_ttl_secs, 90);
        assert_eq!(config.ack_timeout_secs, 60);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SACMES_BIND", "127.0.0.1:9000"),
            ("SACMES_AUTH_TOKEN", "secret"),
            ("SACMES_DISPATCH_CAPACITY", "3"),
        ]);
        let mut config = RelayConfig::default();
        config
            .apply_env(|var| env.get(var).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.dispatch_capacity, 3);
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = RelayConfig::default();
        let result = config.apply_env(|var| {
            (var == "SACMES_DISPATCH_CAPACITY").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn inverted_watermarks_rejected() {
        let mut config = RelayConfig::default();
        config.flow.low_watermark = 0.9;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = RelayConfig::default().with_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn liveness_must_outlast_the_heartbeat() {
        let config = RelayConfig::default()
            .with_heartbeat(Duration::from_secs(10), Duration::from_secs(10));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = RelayConfig::default()
            .with_heartbeat(Duration::from_secs(1), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn session_limits_stay_within_trend_and_analyzer_bounds() {
        let mut config = RelayConfig::default();
        config.limits.max_num_files = u32::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RelayConfig::default();
        config.limits.max_electrodes = 100_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config: RelayConfig = toml::from_str("[limits]\nmax_num_files = 200").unwrap();
        assert_eq!(config.limits.max_num_files, 200);
        assert_eq!(config.limits.max_frequencies, 32);
        assert!(config.validate().is_ok());
    }
}
