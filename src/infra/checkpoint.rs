// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Persists the full training state after every epoch and keeps a
// byte copy of the best one.
//
// What gets saved:
//   1. <path>              — TrainingState, bincode-encoded:
//                            epoch, best_loss, model_state,
//                            optimizer_state (Burn record blobs)
//   2. <best_path>         — byte copy of (1) when the epoch set a
//                            new best validation loss
//   3. train_config.json   — the run configuration, next to (1),
//                            so `evaluate` can rebuild the model
//
// Save protocol:
//   remove stale <path>.temp
//     → write <path>.temp + fsync
//     → rename <path>.temp → <path>     (atomic replace)
//     → copy <path> → <best_path>       (only if is_best)
//
// A failure before the rename deletes the temp file and leaves
// <path> exactly as it was. A reader of <path> therefore always
// sees either the previous complete checkpoint or the new one.
//
// Reference: Burn Book §5 (Records and Checkpointing)
//            Rust Book §9 (Error Handling)

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::train_use_case::TrainConfig;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("cannot {op} '{}'", .path.display())]
    Io {
        op:     &'static str,
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot encode training state")]
    Encode(#[source] bincode::Error),

    #[error("'{}' is not a valid checkpoint", .path.display())]
    Decode {
        path:   PathBuf,
        #[source]
        source: bincode::Error,
    },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> CheckpointError + 'a {
    move |source| CheckpointError::Io { op, path: path.to_path_buf(), source }
}

/// Everything needed to continue training where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch (1-based)
    pub epoch:           usize,
    /// Best validation loss seen so far; +inf before any
    pub best_loss:       f64,
    pub model_state:     Vec<u8>,
    pub optimizer_state: Vec<u8>,
}

pub struct CheckpointManager {
    path:      PathBuf,
    best_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>, best_path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), best_path: best_path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best_path(&self) -> &Path {
        &self.best_path
    }

    /// `<path>.temp`
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".temp");
        PathBuf::from(name)
    }

    /// Directory holding the checkpoint (and train_config.json)
    pub fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomically replace the checkpoint with `state`; also refresh the
    /// best copy when `is_best`.
    pub fn save(&self, state: &TrainingState, is_best: bool) -> Result<(), CheckpointError> {
        self.save_with(state, is_best, |file, bytes| file.write_all(bytes))
    }

    /// `save` with the temp-file write supplied by the caller.
    fn save_with<W>(&self, state: &TrainingState, is_best: bool, write: W) -> Result<(), CheckpointError>
    where
        W: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        let bytes = bincode::serialize(state).map_err(CheckpointError::Encode)?;
        let temp  = self.temp_path();

        fs::create_dir_all(self.dir()).map_err(io_err("create directory", &self.dir()))?;

        // ── Step 1: clear a temp file left by an interrupted save ──
        if temp.exists() {
            tracing::warn!("Removing stale '{}'", temp.display());
            fs::remove_file(&temp).map_err(io_err("remove", &temp))?;
        }

        // ── Step 2: write + fsync the temp file ──
        let written = File::create(&temp)
            .map_err(io_err("create", &temp))
            .and_then(|mut file| {
                write(&mut file, &bytes).map_err(io_err("write", &temp))?;
                file.sync_all().map_err(io_err("sync", &temp))
            });

        // ── Step 3: on failure drop the temp file, keep <path> ──
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        // ── Step 4: atomic replace ──
        if let Err(source) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(CheckpointError::Io { op: "rename into", path: self.path.clone(), source });
        }

        // ── Step 5: best copy ──
        if is_best {
            fs::copy(&self.path, &self.best_path).map_err(io_err("copy to", &self.best_path))?;
            tracing::info!("New best model saved to '{}'", self.best_path.display());
        }

        tracing::debug!("Saved checkpoint for epoch {} ({} bytes)", state.epoch, bytes.len());
        Ok(())
    }

    pub fn load(&self) -> Result<TrainingState, CheckpointError> {
        Self::load_from(&self.path)
    }

    pub fn load_best(&self) -> Result<TrainingState, CheckpointError> {
        Self::load_from(&self.best_path)
    }

    pub fn load_from(path: &Path) -> Result<TrainingState, CheckpointError> {
        let bytes = fs::read(path).map_err(io_err("read", path))?;
        bincode::deserialize(&bytes).map_err(|source| CheckpointError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    // ─── Run configuration ────────────────────────────────────────────────────
    pub fn config_path(&self) -> PathBuf {
        self.dir().join("train_config.json")
    }

    /// Save the run configuration next to the checkpoint so the model
    /// can be rebuilt later.
    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        let path = self.config_path();
        fs::create_dir_all(self.dir())
            .with_context(|| format!("Cannot create '{}'", self.dir().display()))?;

        let json = serde_json::to_string_pretty(cfg)?;
        fs::write(&path, json)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;

        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    pub fn load_config(&self) -> Result<TrainConfig> {
        let path = self.config_path();
        let json = fs::read_to_string(&path).with_context(|| {
            format!(
                "Cannot read config from '{}'. \
                 Make sure you have run 'train' before 'evaluate'.",
                path.display()
            )
        })?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed config in '{}'", path.display()))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn state(epoch: usize, best_loss: f64) -> TrainingState {
        TrainingState {
            epoch,
            best_loss,
            model_state:     vec![epoch as u8; 64],
            optimizer_state: vec![7; 16],
        }
    }

    fn manager(dir: &Path) -> CheckpointManager {
        CheckpointManager::new(dir.join("deepspeech.pth"), dir.join("model_best.pth"))
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let m   = manager(dir.path());
        m.save(&state(3, 1.25), false).unwrap();

        assert_eq!(m.load().unwrap(), state(3, 1.25));
        assert!(!m.temp_path().exists());
        assert!(!m.best_path().exists());
    }

    #[test]
    fn test_best_copy_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let m   = manager(dir.path());
        m.save(&state(1, 0.9), true).unwrap();

        assert_eq!(fs::read(m.path()).unwrap(), fs::read(m.best_path()).unwrap());

        // A later non-best save leaves the best copy alone
        m.save(&state(2, 0.9), false).unwrap();
        assert_eq!(m.load_best().unwrap().epoch, 1);
        assert_eq!(m.load().unwrap().epoch, 2);
    }

    #[test]
    fn test_failed_write_leaves_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let m   = manager(dir.path());
        m.save(&state(1, 2.0), false).unwrap();
        let before = fs::read(m.path()).unwrap();

        // Half the bytes reach the disk, then the write fails
        let err = m
            .save_with(&state(2, 1.0), true, |file, bytes| {
                file.write_all(&bytes[..bytes.len() / 2])?;
                Err(io::Error::new(io::ErrorKind::Other, "device lost"))
            })
            .unwrap_err();

        assert!(matches!(err, CheckpointError::Io { op: "write", .. }));
        assert_eq!(fs::read(m.path()).unwrap(), before);
        assert!(!m.temp_path().exists());
        assert!(!m.best_path().exists());
    }

    #[test]
    fn test_stale_temp_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let m   = manager(dir.path());
        fs::write(m.temp_path(), b"half a checkpoint").unwrap();

        m.save(&state(4, 0.5), false).unwrap();
        assert!(!m.temp_path().exists());
        assert_eq!(m.load().unwrap().epoch, 4);
    }

    #[test]
    fn test_truncated_checkpoint_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let m   = manager(dir.path());
        fs::write(m.path(), [1u8, 2, 3]).unwrap();
        assert!(matches!(m.load(), Err(CheckpointError::Decode { .. })));
    }

    #[test]
    fn test_missing_checkpoint_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let m   = manager(dir.path());
        assert!(matches!(m.load(), Err(CheckpointError::Io { op: "read", .. })));
    }

    #[test]
    fn test_infinite_best_loss_survives_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let m   = manager(dir.path());
        m.save(&state(1, f64::INFINITY), false).unwrap();
        assert_eq!(m.load().unwrap().best_loss, f64::INFINITY);
    }

    #[test]
    fn test_nested_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let m   = manager(&dir.path().join("runs").join("a"));
        m.save(&state(1, 1.0), false).unwrap();
        assert!(m.exists());
        assert_eq!(m.dir(), dir.path().join("runs").join("a"));
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        let m = CheckpointManager::new("/tmp/x/deepspeech.pth", "/tmp/x/best.pth");
        assert_eq!(m.temp_path(), PathBuf::from("/tmp/x/deepspeech.pth.temp"));
    }
}
