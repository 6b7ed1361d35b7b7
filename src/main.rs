//! `spin`: train a spectral inference network from the command line.
//!
//! Loads a preset or JSON config, applies flag overrides, trains, and prints
//! eigenvalues measured on held-out points next to the closed-form reference
//! when one exists.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use spectral_inference::config::EVAL_POINTS;
use spectral_inference::physics::exact::reference_eigenvalues;
use spectral_inference::runtime::{run, RunConfig, Termination};
use tracing_subscriber::EnvFilter;

/// Spectral inference network trainer.
#[derive(Parser, Debug)]
#[command(name = "spin", about = "Learn operator eigenfunctions with spectral inference networks", version)]
struct Cli {
    /// JSON run config. Fields left out take default values.
    #[arg(short, long, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Named setup: laplace-1d, laplace-2d, hydrogen-2d, hydrogen-3d.
    #[arg(short, long, default_value = "laplace-1d")]
    preset: String,

    /// Iteration budget.
    #[arg(short = 'n', long)]
    iterations: Option<u64>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Moving-average rate β.
    #[arg(long)]
    beta: Option<f64>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Number of eigenfunctions k.
    #[arg(short, long)]
    k: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Directory for checkpoints and history.
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Resume from the latest checkpoint in --checkpoint-dir.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Hide the progress bar.
    #[arg(long, default_value_t = false)]
    quiet: bool,

    /// Print the resolved config as JSON and exit.
    #[arg(long, default_value_t = false)]
    print_config: bool,
}

impl Cli {
    fn resolve(&self) -> anyhow::Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::from_preset(&self.preset)?,
        };
        if let Some(n) = self.iterations {
            config.iterations = n;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(beta) = self.beta {
            config.beta = beta;
        }
        if let Some(b) = self.batch_size {
            config.batch_size = b;
        }
        if let Some(k) = self.k {
            config.n_eigenfunctions = k;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = Some(dir.clone());
        }
        config.resume |= self.resume;
        config.show_progress &= !self.quiet;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.resolve()?;
    config.validate().context("invalid run configuration")?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    tracing::info!("spin v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "operator={:?} dim={} widths={:?} k={} iterations={}",
        config.operator,
        config.dim,
        config.widths(),
        config.n_eigenfunctions,
        config.iterations,
    );

    let outcome = run(config.clone()).context("training failed")?;
    if outcome.termination == Termination::Stopped {
        tracing::info!("stopped at iteration {}", outcome.iterations);
    } else {
        tracing::info!("completed {} iterations", outcome.iterations);
    }

    let Some(predicted) = &outcome.eigenvalues else {
        tracing::warn!("no eigenvalue estimates on the held-out points");
        return Ok(());
    };
    let (lo, hi) = config.bounds;
    let exact = reference_eigenvalues(&config.operator, lo, hi, config.dim, config.n_eigenfunctions);

    println!("eigenvalues on {EVAL_POINTS} held-out points");
    println!("{:>4}  {:>14}  {:>14}  {:>10}", "i", "predicted", "exact", "rel. err");
    for (i, p) in predicted.iter().enumerate() {
        match exact.as_ref().map(|e| e[i]) {
            Some(e) => println!("{:>4}  {:>14.6}  {:>14.6}  {:>10.4}", i + 1, p, e, ((p - e) / e).abs()),
            None => println!("{:>4}  {:>14.6}  {:>14}  {:>10}", i + 1, p, "-", "-"),
        }
    }

    let health = &outcome.health;
    tracing::info!("Health: {:?}", health.status);
    tracing::info!("  Loss (window mean): {:.6} ± {:.6}", health.loss_mean, health.loss_std);
    tracing::info!("  Loss (window range): [{:.6}, {:.6}]", health.loss_min, health.loss_max);
    tracing::info!("  Grad norm (mean / max): {:.3e} / {:.3e}", health.grad_norm_mean, health.grad_norm_max);
    tracing::info!("  Step time: {:.2} ms", health.step_ms_mean);
    Ok(())
}
