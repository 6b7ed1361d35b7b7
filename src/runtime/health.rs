//! Training health monitoring.
//!
//! Rolling windows over per-step metrics (loss, gradient norm, step time) with
//! threshold checks and a z-score spike detector. The trainer logs a warning
//! when a window degrades and includes a [`HealthReport`] in its outcome.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Health status levels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// A metric crossed its warning threshold.
    Degraded(String),
    /// A metric crossed its critical threshold.
    Critical(String),
}

/// One recorded value, keyed by training iteration.
#[derive(Clone, Copy, Debug)]
pub struct MetricSample {
    pub iteration: u64,
    pub value: f64,
}

/// A rolling metric tracker.
#[derive(Clone, Debug)]
pub struct MetricTracker {
    pub name: String,

    pub samples: VecDeque<MetricSample>,

    pub max_samples: usize,

    /// Upper warning bound.
    pub warn_threshold: Option<f64>,

    /// Upper critical bound.
    pub critical_threshold: Option<f64>,
}

impl MetricTracker {
    pub fn new(name: &str, max_samples: usize) -> Self {
        Self {
            name: name.to_string(),
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
            warn_threshold: None,
            critical_threshold: None,
        }
    }

    pub fn with_thresholds(mut self, warn: f64, critical: f64) -> Self {
        self.warn_threshold = Some(warn);
        self.critical_threshold = Some(critical);
        self
    }

    pub fn record(&mut self, iteration: u64, value: f64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(MetricSample { iteration, value });
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().map(|s| s.value)
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.value).sum::<f64>() / self.samples.len() as f64
    }

    /// Sample standard deviation over the window.
    pub fn std_dev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .samples
            .iter()
            .map(|s| (s.value - mean).powi(2))
            .sum::<f64>()
            / (self.samples.len() - 1) as f64;
        var.sqrt()
    }

    pub fn max(&self) -> f64 {
        self.samples.iter().map(|s| s.value).fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min(&self) -> f64 {
        self.samples.iter().map(|s| s.value).fold(f64::INFINITY, f64::min)
    }

    pub fn status(&self) -> HealthStatus {
        let Some(val) = self.latest() else {
            return HealthStatus::Healthy;
        };
        if !val.is_finite() {
            return HealthStatus::Critical(format!("{}: non-finite value", self.name));
        }
        if let Some(crit) = self.critical_threshold {
            if val >= crit {
                return HealthStatus::Critical(format!("{}: {:.3e} >= critical {:.3e}", self.name, val, crit));
            }
        }
        if let Some(warn) = self.warn_threshold {
            if val >= warn {
                return HealthStatus::Degraded(format!("{}: {:.3e} >= warn {:.3e}", self.name, val, warn));
            }
        }
        HealthStatus::Healthy
    }

    /// Latest value more than 3σ from the window mean.
    pub fn is_anomalous(&self) -> bool {
        if let Some(val) = self.latest() {
            let std = self.std_dev();
            if std > 1e-12 {
                return ((val - self.mean()) / std).abs() > 3.0;
            }
        }
        false
    }
}

/// Per-run training monitor.
#[derive(Clone, Debug)]
pub struct TrainingMonitor {
    pub loss: MetricTracker,

    /// Norm of the descent direction.
    pub grad_norm: MetricTracker,

    /// Wall time per step (ms).
    pub step_time: MetricTracker,

    pub total_steps: u64,
}

impl TrainingMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            loss: MetricTracker::new("loss", window),
            grad_norm: MetricTracker::new("grad_norm", window).with_thresholds(1e4, 1e8),
            step_time: MetricTracker::new("step_ms", window),
            total_steps: 0,
        }
    }

    pub fn record_step(&mut self, iteration: u64, loss: f64, grad_norm: f64, step_ms: f64) {
        self.total_steps += 1;
        self.loss.record(iteration, loss);
        self.grad_norm.record(iteration, grad_norm);
        self.step_time.record(iteration, step_ms);
    }

    pub fn overall_status(&self) -> HealthStatus {
        let checks = [self.loss.status(), self.grad_norm.status()];
        if let Some(c) = checks.iter().find(|c| matches!(c, HealthStatus::Critical(_))) {
            return c.clone();
        }
        if let Some(c) = checks.iter().find(|c| matches!(c, HealthStatus::Degraded(_))) {
            return c.clone();
        }
        HealthStatus::Healthy
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            total_steps: self.total_steps,
            loss_mean: self.loss.mean(),
            loss_std: self.loss.std_dev(),
            loss_min: self.loss.min(),
            loss_max: self.loss.max(),
            grad_norm_mean: self.grad_norm.mean(),
            grad_norm_max: self.grad_norm.max(),
            step_ms_mean: self.step_time.mean(),
        }
    }
}

/// A health report snapshot over the current windows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_steps: u64,
    pub loss_mean: f64,
    pub loss_std: f64,
    pub loss_min: f64,
    pub loss_max: f64,
    pub grad_norm_mean: f64,
    pub grad_norm_max: f64,
    pub step_ms_mean: f64,
}
