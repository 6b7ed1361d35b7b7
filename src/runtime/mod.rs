//! Runtime: ties the learning core into a complete training run.
//!
//! This module provides:
//! - Run configuration (JSON files, presets, validation)
//! - The training loop driver with progress reporting and callbacks
//! - Checkpoint persistence and resume
//! - Health monitoring over rolling metric windows

pub mod checkpoint;
pub mod config;
pub mod health;
pub mod trainer;

pub use checkpoint::{Checkpoint, Checkpointer};
pub use config::RunConfig;
pub use trainer::{run, History, Phase, Progress, RunOutcome, Termination, Trainer};
