//! Training loop driver.
//!
//! Drives `Spin::step` over freshly sampled batches:
//! 1. Sample a batch uniformly on the configured box
//! 2. Step (β = 1 on the very first step of a fresh run)
//! 3. Record loss and eigenvalues, update the progress bar
//! 4. Every `callback_every` steps, ask the callback whether to stop
//! 5. At step 1 and every `checkpoint_every` steps, write a checkpoint
//!
//! A numerical failure terminates the run; the trainer keeps the last
//! committed state so it can still be inspected or checkpointed.

use std::ops::ControlFlow;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::checkpoint::{Checkpoint, Checkpointer};
use super::config::RunConfig;
use super::health::{HealthReport, HealthStatus, TrainingMonitor};
use crate::config::{EVAL_POINTS, HELD_OUT_SEED};
use crate::error::{Result, SpinError, Stage};
use crate::learning::spin::{Eigenpairs, Spin, SpinState};
use crate::physics::sampler::BoxSampler;

/// Loss and eigenvalue trajectories, one entry per step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub loss: Vec<f64>,
    pub eigenvalues: Vec<Vec<f64>>,
}

impl History {
    pub fn push(&mut self, loss: f64, eigenvalues: &[f64]) {
        self.loss.push(loss);
        self.eigenvalues.push(eigenvalues.to_vec());
    }

    pub fn len(&self) -> usize {
        self.loss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loss.is_empty()
    }
}

/// Why a run stopped.
#[derive(Clone, Debug, PartialEq)]
pub enum Termination {
    /// The iteration budget was used up.
    Completed,
    /// The callback asked to stop.
    Stopped,
    /// A step failed numerically.
    Failed(Stage),
    /// A step refused its inputs (batch shape, moving-average rate).
    Rejected,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Phase {
    Uninitialized,
    Stepping,
    Terminated(Termination),
}

/// What the callback sees.
pub struct Progress<'a> {
    pub iteration: u64,
    pub state: &'a SpinState,
    pub history: &'a History,
}

/// Summary of a finished run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub termination: Termination,
    pub iterations: u64,
    pub final_loss: Option<f64>,
    /// diag(Λ) on the held-out points; `None` if that evaluation failed.
    pub eigenvalues: Option<Array1<f64>>,
    pub history: History,
    pub health: HealthReport,
    pub state: SpinState,
}

pub struct Trainer {
    config: RunConfig,
    spin: Spin,
    sampler: BoxSampler,
    rng: StdRng,
    state: Option<SpinState>,
    history: History,
    monitor: TrainingMonitor,
    checkpointer: Option<Checkpointer>,
    phase: Phase,
}

impl Trainer {
    /// Validate `config` and build the model, operator and optimizer.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let model = config.build_model()?;
        let spin = Spin::new(
            model,
            config.operator.build(),
            config.build_optimizer(),
            config.sparsifying_k,
        )?;
        let (lo, hi) = config.bounds;
        let sampler = BoxSampler::new(lo, hi, config.dim)?;
        let window = (config.log_every as usize).clamp(10, 10_000);
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            checkpointer: config.checkpoint_dir.clone().map(Checkpointer::new),
            spin,
            sampler,
            state: None,
            history: History::default(),
            monitor: TrainingMonitor::new(window),
            phase: Phase::Uninitialized,
            config,
        })
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Last committed state.
    pub fn state(&self) -> Option<&SpinState> {
        self.state.as_ref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn spin(&self) -> &Spin {
        &self.spin
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Held-out points: a midpoint grid in one dimension, otherwise a
    /// fixed-seed uniform sample independent of the training stream.
    pub fn evaluation_points(&self) -> Array2<f64> {
        if self.config.dim == 1 {
            self.sampler.midpoints(EVAL_POINTS)
        } else {
            self.sampler.sample(&mut StdRng::seed_from_u64(HELD_OUT_SEED), EVAL_POINTS)
        }
    }

    /// Eigenpairs of the committed parameters on the held-out points,
    /// whitened with their own covariance.
    pub fn evaluate(&self) -> Result<Eigenpairs> {
        let state = self.state.as_ref().ok_or_else(|| SpinError::config("trainer has no state"))?;
        self.spin.eigenpairs(state, &self.evaluation_points().view(), 1.0)
    }

    /// Fresh parameters and averages, or the latest checkpoint when resuming.
    pub fn initialize(&mut self) -> Result<()> {
        if let Some(checkpoint) = self.resume_checkpoint()? {
            self.spin.model.check_params(&checkpoint.state.params)?;
            if !checkpoint.state.is_healthy() {
                return Err(SpinError::config("checkpoint state contains non-finite values"));
            }
            info!(iteration = checkpoint.iteration(), "resuming from checkpoint");
            // Continue the batch stream instead of replaying it.
            self.rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(checkpoint.iteration()));
            self.history = checkpoint.history;
            self.state = Some(checkpoint.state);
        } else {
            let mut init_rng = StdRng::seed_from_u64(self.config.init_seed);
            let state = self.spin.initial_state(&mut init_rng);
            info!(
                params = state.params.num_params(),
                k = self.spin.model.output_dim(),
                operator = self.spin.operator.name(),
                "initialised"
            );
            if let Some(mask) = &self.spin.sparsity {
                info!(density = mask.density(), "sparse weight mask");
            }
            self.state = Some(state);
        }
        self.phase = Phase::Stepping;
        Ok(())
    }

    fn resume_checkpoint(&self) -> Result<Option<Checkpoint>> {
        match (&self.checkpointer, self.config.resume) {
            (Some(ckpt), true) => ckpt.load_latest(),
            _ => Ok(None),
        }
    }

    /// Run until the budget is exhausted, the callback stops, or a step fails.
    pub fn run_with<F>(&mut self, mut callback: F) -> Result<RunOutcome>
    where
        F: FnMut(&Progress<'_>) -> ControlFlow<()>,
    {
        if self.phase == Phase::Uninitialized {
            self.initialize()?;
        }
        let Some(mut state) = self.state.clone() else {
            return Err(SpinError::config("trainer has no state"));
        };

        let start = state.iteration;
        let budget = self.config.iterations.saturating_sub(start);
        let pb = self.progress_bar(budget);
        let mut termination = Termination::Completed;

        for iteration in start + 1..=self.config.iterations {
            let batch = self.sampler.sample(&mut self.rng, self.config.batch_size);
            let beta = if state.iteration == 0 { 1.0 } else { self.config.beta };

            let t0 = Instant::now();
            let out = match self.spin.step(&state, &batch.view(), beta) {
                Ok(out) => out,
                Err(e) => {
                    error!(iteration, error = %e, "training step failed");
                    pb.abandon_with_message(format!("failed at step {iteration}"));
                    let termination = match e.stage() {
                        Some(stage) => Termination::Failed(stage),
                        None => Termination::Rejected,
                    };
                    self.phase = Phase::Terminated(termination);
                    self.state = Some(state);
                    return Err(e);
                }
            };
            let step_ms = t0.elapsed().as_secs_f64() * 1e3;

            state = out.state;
            self.history.push(out.loss, &out.eigenvalues.to_vec());
            self.monitor.record_step(iteration, out.loss, out.grad_norm, step_ms);
            pb.set_message(format!("loss {:.4}", out.loss));
            pb.inc(1);

            if iteration % self.config.log_every == 0 {
                info!(
                    iteration,
                    loss = out.loss,
                    eigenvalues = ?out.eigenvalues.to_vec(),
                    grad_norm = out.grad_norm,
                    "training"
                );
                debug!(
                    iteration,
                    sigma_trace = state.averages.sigma.diag().sum(),
                    jacobian_max = state.averages.jacobian.max_abs(),
                    "moving averages"
                );
                match self.monitor.overall_status() {
                    HealthStatus::Healthy => {}
                    HealthStatus::Degraded(msg) | HealthStatus::Critical(msg) => warn!(iteration, "{msg}"),
                }
                if self.monitor.loss.is_anomalous() {
                    warn!(iteration, loss = out.loss, "loss spike");
                }
            }

            if iteration % self.config.callback_every == 0 {
                let progress = Progress {
                    iteration,
                    state: &state,
                    history: &self.history,
                };
                if callback(&progress).is_break() {
                    info!(iteration, "stopped by callback");
                    termination = Termination::Stopped;
                    self.state = Some(state.clone());
                    break;
                }
            }

            if iteration == 1 || iteration % self.config.checkpoint_every == 0 {
                self.state = Some(state.clone());
                self.checkpoint(&state);
            }
        }

        match termination {
            Termination::Completed => pb.finish_with_message("training complete"),
            _ => pb.abandon_with_message("stopped"),
        }
        self.state = Some(state.clone());
        self.phase = Phase::Terminated(termination.clone());
        if let Some(ckpt) = &self.checkpointer {
            if let Err(e) = ckpt.write_history(&self.history) {
                warn!(error = %e, "could not write history");
            }
        }

        let eigenvalues = match self.evaluate() {
            Ok(pairs) => Some(pairs.eigenvalues),
            Err(e) => {
                warn!(error = %e, "held-out evaluation failed");
                None
            }
        };

        Ok(RunOutcome {
            termination,
            iterations: state.iteration,
            final_loss: self.history.loss.last().copied(),
            eigenvalues,
            history: self.history.clone(),
            health: self.monitor.report(),
            state,
        })
    }

    /// Best-effort checkpoint write; failures are logged and training continues.
    fn checkpoint(&self, state: &SpinState) {
        let Some(ckpt) = &self.checkpointer else {
            return;
        };
        let result = Checkpoint::new(state.clone(), self.history.clone(), &self.config)
            .and_then(|c| ckpt.save(&c));
        match result {
            Ok(path) => info!(iteration = state.iteration, path = %path.display(), "checkpoint saved"),
            Err(e) => warn!(iteration = state.iteration, error = %e, "checkpoint failed; continuing"),
        }
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

/// Train with `config` to completion.
pub fn run(config: RunConfig) -> Result<RunOutcome> {
    Trainer::new(config)?.run_with(|_| ControlFlow::Continue(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_push() {
        let mut h = History::default();
        assert!(h.is_empty());
        h.push(-5.0, &[-1.0, -4.0]);
        h.push(-7.0, &[-2.0, -5.0]);
        assert_eq!(h.len(), 2);
        assert_eq!(h.eigenvalues[1], vec![-2.0, -5.0]);
        assert_eq!(h.loss, vec![-5.0, -7.0]);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = RunConfig {
            n_eigenfunctions: 0,
            ..RunConfig::default()
        };
        assert!(matches!(Trainer::new(config), Err(SpinError::Config(_))));
    }

    #[test]
    fn test_rejected_step_is_not_a_numerical_failure() {
        let config = RunConfig {
            hidden: vec![8],
            n_eigenfunctions: 2,
            iterations: 5,
            show_progress: false,
            ..RunConfig::default()
        };
        let mut trainer = Trainer::new(config).unwrap();
        // Step 1 forces β = 1; the bad rate is only seen from step 2 on.
        trainer.config.beta = 1.5;
        let err = trainer.run_with(|_| ControlFlow::Continue(())).unwrap_err();
        assert!(matches!(err, SpinError::Config(_)));
        assert_eq!(trainer.phase(), &Phase::Terminated(Termination::Rejected));
        assert_eq!(trainer.state().unwrap().iteration, 1);
    }

    #[test]
    fn test_numerical_failure_records_its_stage() {
        let config = RunConfig {
            hidden: vec![8],
            n_eigenfunctions: 2,
            iterations: 5,
            show_progress: false,
            ..RunConfig::default()
        };
        let mut trainer = Trainer::new(config).unwrap();
        trainer.initialize().unwrap();
        // A singular Σ̄ that β = 0 keeps in place.
        if let Some(state) = trainer.state.as_mut() {
            state.averages.sigma.fill(0.0);
            state.iteration = 1;
        }
        trainer.config.beta = 0.0;
        let err = trainer.run_with(|_| ControlFlow::Continue(())).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::CovarianceFactorization));
        assert_eq!(
            trainer.phase(),
            &Phase::Terminated(Termination::Failed(Stage::CovarianceFactorization))
        );
        assert_eq!(trainer.state().unwrap().iteration, 1);
    }

    #[test]
    fn test_initialize_sets_cold_state() {
        let config = RunConfig {
            hidden: vec![8],
            n_eigenfunctions: 2,
            show_progress: false,
            ..RunConfig::default()
        };
        let mut trainer = Trainer::new(config).unwrap();
        assert_eq!(trainer.phase(), &Phase::Uninitialized);
        trainer.initialize().unwrap();
        assert_eq!(trainer.phase(), &Phase::Stepping);
        let state = trainer.state().unwrap();
        assert_eq!(state.iteration, 0);
        assert_eq!(state.averages.sigma, ndarray::Array2::<f64>::eye(2));
        assert!(state.averages.jacobian.max_abs() == 0.0);
    }
}
