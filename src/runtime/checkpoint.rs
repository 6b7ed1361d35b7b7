//! Checkpoint persistence.
//!
//! A checkpoint is the committed [`SpinState`] plus the run history and the
//! config it was produced with, serialised with bincode. Files are named
//! `checkpoint_<iteration>.bin` and written through a temporary file so an
//! interrupted write never replaces a good checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::RunConfig;
use super::trainer::History;
use crate::error::{Result, SpinError};
use crate::learning::spin::SpinState;

const PREFIX: &str = "checkpoint_";
const EXTENSION: &str = "bin";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: SpinState,
    pub history: History,
    /// The run config as JSON (its tagged enums are not bincode-friendly).
    pub config_json: String,
}

impl Checkpoint {
    pub fn new(state: SpinState, history: History, config: &RunConfig) -> Result<Self> {
        let config_json = serde_json::to_string(config)
            .map_err(|e| SpinError::config(format!("config is not serialisable: {e}")))?;
        Ok(Self {
            state,
            history,
            config_json,
        })
    }

    pub fn iteration(&self) -> u64 {
        self.state.iteration
    }

    pub fn config(&self) -> Result<RunConfig> {
        serde_json::from_str(&self.config_json)
            .map_err(|e| SpinError::config(format!("checkpoint config is unreadable: {e}")))
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

/// Reads and writes checkpoints in one directory.
#[derive(Clone, Debug)]
pub struct Checkpointer {
    dir: PathBuf,
}

impl Checkpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, iteration: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{iteration:010}.{EXTENSION}"))
    }

    /// Write `checkpoint` and return its path.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        self.write_encoded(checkpoint.iteration(), checkpoint.to_bytes())
    }

    fn write_encoded(&self, iteration: u64, encoded: bincode::Result<Vec<u8>>) -> Result<PathBuf> {
        let path = self.path_for(iteration);
        let bytes = encoded.map_err(|e| SpinError::resource(&path, e))?;
        fs::create_dir_all(&self.dir).map_err(|e| SpinError::resource(&self.dir, e))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(|e| SpinError::resource(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| SpinError::resource(&path, e))?;
        debug!(path = %path.display(), bytes = bytes.len(), "checkpoint written");
        Ok(path)
    }

    /// The checkpoint with the highest iteration, if any.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let Some(path) = self.latest_path()? else {
            return Ok(None);
        };
        let bytes = fs::read(&path).map_err(|e| SpinError::resource(&path, e))?;
        let checkpoint = Checkpoint::from_bytes(&bytes).map_err(|e| SpinError::resource(&path, e))?;
        Ok(Some(checkpoint))
    }

    fn latest_path(&self) -> Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let entries = fs::read_dir(&self.dir).map_err(|e| SpinError::resource(&self.dir, e))?;
        let latest = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                let iteration = parse_iteration(&path)?;
                Some((iteration, path))
            })
            .max_by_key(|(iteration, _)| *iteration)
            .map(|(_, path)| path);
        Ok(latest)
    }

    /// Dump the history as pretty JSON next to the checkpoints.
    pub fn write_history(&self, history: &History) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| SpinError::resource(&self.dir, e))?;
        let path = self.dir.join("history.json");
        let json = serde_json::to_string_pretty(history)
            .map_err(|e| SpinError::resource(&path, e))?;
        fs::write(&path, json).map_err(|e| SpinError::resource(&path, e))?;
        Ok(path)
    }
}

fn parse_iteration(path: &Path) -> Option<u64> {
    if path.extension()? != EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.strip_prefix(PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::optimizer::OptimizerState;
    use crate::linalg::covariance::Averages;
    use crate::network::params::{Dense, Params, SigmaJacobian};
    use tempfile::TempDir;

    fn state(iteration: u64) -> SpinState {
        let params = Params::new(vec![Dense::zeros(1, 2, true)]);
        SpinState {
            opt_state: OptimizerState {
                count: iteration,
                second_moment: Some(params.zeros_like()),
                velocity: None,
            },
            averages: Averages::cold(SigmaJacobian::zeros(&params, 2)),
            params,
            iteration,
        }
    }

    #[test]
    fn test_parse_iteration() {
        assert_eq!(parse_iteration(Path::new("/x/checkpoint_0000000042.bin")), Some(42));
        assert_eq!(parse_iteration(Path::new("/x/checkpoint_0000000042.tmp")), None);
        assert_eq!(parse_iteration(Path::new("/x/history.json")), None);
    }

    #[test]
    fn test_save_and_load_latest() {
        let dir = TempDir::new().unwrap();
        let ckpt = Checkpointer::new(dir.path().join("run"));
        assert!(ckpt.load_latest().unwrap().is_none());

        let config = RunConfig::default();
        let mut history = History::default();
        history.push(-3.0, &[-1.0, -2.0]);
        for it in [1, 20, 3] {
            let c = Checkpoint::new(state(it), history.clone(), &config).unwrap();
            ckpt.save(&c).unwrap();
        }
        let latest = ckpt.load_latest().unwrap().unwrap();
        assert_eq!(latest.iteration(), 20);
        assert_eq!(latest.state, state(20));
        assert_eq!(latest.history, history);
        assert_eq!(latest.config().unwrap(), config);
    }

    #[test]
    fn test_corrupt_checkpoint_is_resource_error() {
        let dir = TempDir::new().unwrap();
        let ckpt = Checkpointer::new(dir.path());
        fs::write(ckpt.path_for(5), b"garbage").unwrap();
        let err = ckpt.load_latest().unwrap_err();
        assert!(matches!(err, SpinError::Resource { .. }));
    }

    #[test]
    fn test_encoding_failure_is_resource_error() {
        let dir = TempDir::new().unwrap();
        let ckpt = Checkpointer::new(dir.path().join("run"));
        let err = ckpt
            .write_encoded(3, Err(Box::new(bincode::ErrorKind::SizeLimit)))
            .unwrap_err();
        match &err {
            SpinError::Resource { path, .. } => assert_eq!(path, &ckpt.path_for(3)),
            other => panic!("expected a resource error, got {other:?}"),
        }
        assert!(!err.is_fatal());
        assert!(ckpt.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_write_history() {
        let dir = TempDir::new().unwrap();
        let ckpt = Checkpointer::new(dir.path());
        let mut history = History::default();
        history.push(1.5, &[0.5, 1.0]);
        let path = ckpt.write_history(&history).unwrap();
        let text = fs::read_to_string(path).unwrap();
        let back: History = serde_json::from_str(&text).unwrap();
        assert_eq!(back, history);
    }
}
