//! Adaptive flow control
//!
//! Samples dispatcher load on every file arrival and tells the sending
//! agent to slow down or speed up. Two thresholds give hysteresis, and
//! each identity is adjusted at most once per rate-limit window.

use crate::config::FlowConfig;
use crate::dispatcher::LoadMetric;
use crate::types::Identity;
use dashmap::DashMap;
use tokio::time::Instant;

/// Clamp a send interval into `[min, max]`; non-finite values become `max`
#[must_use]
pub fn clamp_interval(seconds: f64, min: f64, max: f64) -> f64 {
    if seconds.is_nan() {
        return max;
    }
    seconds.clamp(min, max)
}

/// Pace an agent has been told to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Normal interval
    Normal,
    /// Slowed under load
    Slow,
}

/// Instruction for one agent
#[derive(Debug, Clone, PartialEq)]
pub struct RateAdjustment {
    /// Clamped pause between files
    pub interval_seconds: f64,
    /// Human-readable cause
    pub reason: String,
    /// Mode the agent is now in
    pub mode: SendMode,
}

#[derive(Debug, Clone, Copy)]
struct AgentPace {
    mode: SendMode,
    last_adjusted: Option<Instant>,
}

/// Per-identity hysteresis state
#[derive(Debug)]
pub struct FlowController {
    config: FlowConfig,
    paces: DashMap<Identity, AgentPace>,
}

impl FlowController {
    /// Create controller
    #[must_use]
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            paces: DashMap::new(),
        }
    }

    /// Interval an agent starts with, clamped
    #[must_use]
    pub fn initial_interval(&self) -> f64 {
        self.clamp(self.config.normal_interval_secs)
    }

    /// Clamp to the configured safe range
    #[must_use]
    pub fn clamp(&self, seconds: f64) -> f64 {
        clamp_interval(seconds, self.config.min_interval_secs, self.config.max_interval_secs)
    }

    /// Observe load for a file arriving from `identity`
    ///
    /// Returns an instruction when the agent's mode should change and the
    /// identity is outside its rate-limit window.
    pub fn observe(&self, identity: &Identity, load: LoadMetric) -> Option<RateAdjustment> {
        let ratio = load.ratio();
        let now = Instant::now();
        let mut pace = self.paces.entry(identity.clone()).or_insert(AgentPace {
            mode: SendMode::Normal,
            last_adjusted: None,
        });

        let target = match pace.mode {
            SendMode::Normal if ratio > self.config.high_watermark => SendMode::Slow,
            SendMode::Slow if ratio < self.config.low_watermark => SendMode::Normal,
            _ => return None,
        };
        if pace
            .last_adjusted
            .is_some_and(|at| now.duration_since(at) < self.config.min_adjust_interval())
        {
            tracing::debug!(identity = %identity, load = ratio, "rate adjustment suppressed");
            return None;
        }

        pace.mode = target;
        pace.last_adjusted = Some(now);
        let percent = ratio * 100.0;
        let adjustment = match target {
            SendMode::Slow => RateAdjustment {
                interval_seconds: self.clamp(self.config.slow_interval_secs),
                reason: format!("server busy ({percent:.0}% load)"),
                mode: target,
            },
            SendMode::Normal => RateAdjustment {
                interval_seconds: self.clamp(self.config.normal_interval_secs),
                reason: format!("server load normal ({percent:.0}% load)"),
                mode: target,
            },
        };
        tracing::info!(
            identity = %identity,
            load = ratio,
            interval = adjustment.interval_seconds,
            "send rate adjusted"
        );
        Some(adjustment)
    }

    /// Mode an identity is in
    #[must_use]
    pub fn mode(&self, identity: &Identity) -> SendMode {
        self.paces.get(identity).map_or(SendMode::Normal, |p| p.mode)
    }

    /// Forget an identity's pace
    pub fn forget(&self, identity: &Identity) {
        self.paces.remove(identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn load(used: usize) -> LoadMetric {
        LoadMetric { used, total: 10 }
    }

    #[test]
    fn clamp_bounds_both_ends() {
        assert_eq!(clamp_interval(0.0, 0.05, 30.0), 0.05);
        assert_eq!(clamp_interval(-3.0, 0.05, 30.0), 0.05);
        assert_eq!(clamp_interval(1e9, 0.05, 30.0), 30.0);
        assert_eq!(clamp_interval(f64::INFINITY, 0.05, 30.0), 30.0);
        assert_eq!(clamp_interval(f64::NAN, 0.05, 30.0), 30.0);
        assert_eq!(clamp_interval(2.0, 0.05, 30.0), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn hysteresis_between_thresholds() {
        let flow = FlowController::new(FlowConfig::default());
        let id = Identity::new("lab");

        assert!(flow.observe(&id, load(5)).is_none());
        let slow = flow.observe(&id, load(9)).unwrap();
        assert_eq!(slow.mode, SendMode::Slow);
        assert_eq!(slow.interval_seconds, 2.0);

        tokio::time::advance(Duration::from_secs(3)).await;
        // between thresholds: stay slow
        assert!(flow.observe(&id, load(5)).is_none());
        assert_eq!(flow.mode(&id), SendMode::Slow);

        let normal = flow.observe(&id, load(2)).unwrap();
        assert_eq!(normal.mode, SendMode::Normal);
        assert_eq!(normal.interval_seconds, 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn adjustments_are_rate_limited() {
        let flow = FlowController::new(FlowConfig::default());
        let id = Identity::new("lab");

        assert!(flow.observe(&id, load(9)).is_some());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(flow.observe(&id, load(0)).is_none());
        assert_eq!(flow.mode(&id), SendMode::Slow);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(flow.observe(&id, load(0)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn identities_are_independent() {
        let flow = FlowController::new(FlowConfig::default());
        let a = Identity::new("a");
        let b = Identity::new("b");
        assert!(flow.observe(&a, load(9)).is_some());
        assert!(flow.observe(&b, load(9)).is_some());
    }

    #[test]
    fn configured_intervals_are_clamped() {
        let config = FlowConfig {
            slow_interval_secs: 500.0,
            normal_interval_secs: 0.0,
            ..FlowConfig::default()
        };
        let flow = FlowController::new(config);
        assert_eq!(flow.initial_interval(), 0.05);
        assert_eq!(flow.clamp(500.0), 30.0);
    }
}
