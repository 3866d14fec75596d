//! Agent configuration

use crate::error::{AgentError, AgentResult};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Reconnection policy
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up; 0 retries forever
    pub max_attempts: u32,
    /// First backoff delay
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based), without jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff with up to 25% random jitter added
    #[must_use]
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let spread = delay / 4;
        if spread.is_zero() {
            return delay;
        }
        delay + rand::thread_rng().gen_range(Duration::ZERO..=spread)
    }

    /// Whether another attempt is allowed after `failures` failures
    #[must_use]
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts == 0 || failures < self.max_attempts
    }
}

/// Send-loop timing used until the server says otherwise
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySettings {
    /// Wait for `file-processing-complete` when the filters carry no timeout
    pub ack_timeout: Duration,
    /// Pause between files when the filters carry no interval, in seconds
    pub send_interval_secs: f64,
    /// Lower clamp for server-chosen intervals
    pub min_interval_secs: f64,
    /// Upper clamp for server-chosen intervals
    pub max_interval_secs: f64,
    /// Directory re-scan period
    pub poll_interval: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(60),
            send_interval_secs: 0.1,
            min_interval_secs: 0.05,
            max_interval_secs: 30.0,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Everything the agent needs to run
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay endpoint, e.g. `ws://host:5000/agent`
    pub server_url: Url,
    /// Bearer token presented on upgrade
    pub auth_token: Option<String>,
    /// Directory the instrument writes into
    pub watch_dir: PathBuf,
    /// Where the durable identity lives
    pub identity_file: PathBuf,
    /// Send-loop timing
    pub delivery: DeliverySettings,
    /// Reconnection policy
    pub reconnect: ReconnectPolicy,
    /// Silence from the relay (no frame, no ping) after which the
    /// connection is dropped and re-established
    pub liveness_timeout: Duration,
}

impl AgentConfig {
    /// Config with default timing
    pub fn new(server_url: &str, watch_dir: impl Into<PathBuf>) -> AgentResult<Self> {
        let server_url = Url::parse(server_url)
            .map_err(|e| AgentError::Config(format!("bad server url {server_url}: {e}")))?;
        let config = Self {
            server_url,
            auth_token: None,
            watch_dir: watch_dir.into(),
            identity_file: default_identity_file(),
            delivery: DeliverySettings::default(),
            reconnect: ReconnectPolicy::default(),
            liveness_timeout: Duration::from_secs(60),
        };
        config.validate()?;
        Ok(config)
    }

    /// With bearer token
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// With identity file location
    #[must_use]
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = path.into();
        self
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> AgentResult<()> {
        match self.server_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(AgentError::Config(format!(
                    "server url must be ws:// or wss://, got {other}://"
                )))
            }
        }
        let d = &self.delivery;
        if !(d.min_interval_secs > 0.0 && d.min_interval_secs <= d.max_interval_secs) {
            return Err(AgentError::Config(format!(
                "interval bounds [{}, {}] are inverted or non-positive",
                d.min_interval_secs, d.max_interval_secs
            )));
        }
        if d.poll_interval.is_zero() {
            return Err(AgentError::Config("poll interval must be positive".into()));
        }
        if self.liveness_timeout.is_zero() {
            return Err(AgentError::Config("liveness timeout must be positive".into()));
        }
        Ok(())
    }
}

/// `~/.sacmes/agent_id`, or `./agent_id` without a home directory
#[must_use]
pub fn default_identity_file() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".sacmes").join("agent_id"))
        .unwrap_or_else(|| PathBuf::from("agent_id"))
}
