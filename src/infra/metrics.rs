// ============================================================
// Layer 6 — Metrics
// ============================================================
// Running accumulators used inside an epoch, and a CSV log with
// one row per completed epoch.
//
// RunningLoss:
//   sum of accepted losses / number of iterations. A rejected
//   (non-finite, NaN or negative) loss still counts as an
//   iteration and contributes 0.0, so a bad batch pulls the
//   average down rather than being hidden.
//
// WER:
//   accumulated as (Σ edit distance, Σ reference words) and
//   divided once at the end; averaging per-batch rates would
//   over-weight short batches.
//
// Output file: <logdir>/metrics.csv
//
//   epoch,train_loss,val_loss,val_wer,skipped_updates
//   1,1.843210,1.602114,0.912000,0
//   2,1.201877,1.154300,0.704100,3
//
// How to read the metrics:
//   - val_wer is the headline number; 1.0 means every word wrong
//   - skipped_updates > 0 means the loss gate fired that epoch
//
// Reference: Rust Book §12 (I/O and File Handling)

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::wer::WerCounts;

const CSV_HEADER: &str = "epoch,train_loss,val_loss,val_wer,skipped_updates";

// ─── RunningLoss ──────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningLoss {
    sum:        f64,
    iterations: usize,
    skipped:    usize,
}

impl RunningLoss {
    pub fn add(&mut self, loss: f64) {
        self.sum        += loss;
        self.iterations += 1;
    }

    /// A rejected loss: counted, contributes zero
    pub fn add_skipped(&mut self) {
        self.iterations += 1;
        self.skipped    += 1;
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// None before the first iteration
    pub fn mean(&self) -> Option<f64> {
        (self.iterations > 0).then(|| self.sum / self.iterations as f64)
    }
}

// ─── EpochMetrics ─────────────────────────────────────────────────────────────
/// One row of the metrics CSV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch:           usize,
    /// Mean training loss over this replica's batches
    pub train_loss:      f64,
    /// Mean validation loss; NaN when there was nothing to validate
    pub val_loss:        f64,
    pub val_wer:         f64,
    pub skipped_updates: usize,
}

impl EpochMetrics {
    pub fn new(epoch: usize, train: &RunningLoss, val: &RunningLoss, wer: WerCounts) -> Self {
        Self {
            epoch,
            train_loss:      train.mean().unwrap_or(f64::NAN),
            val_loss:        val.mean().unwrap_or(f64::NAN),
            val_wer:         wer.rate().unwrap_or(f64::NAN),
            skipped_updates: train.skipped(),
        }
    }

    /// Returns true if this epoch improved over the previous best val_loss.
    /// A non-finite loss never counts as an improvement.
    pub fn is_improvement(&self, best_val_loss: f64) -> bool {
        self.val_loss.is_finite() && self.val_loss < best_val_loss
    }
}

// ─── MetricsLogger ────────────────────────────────────────────────────────────
/// Appends epoch metrics to a CSV file for later analysis.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet, so a
    /// resumed run keeps appending to the same log.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create log directory '{}'", dir.display()))?;

        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)
                .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
            writeln!(f, "{CSV_HEADER}")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;

        writeln!(
            f,
            "{},{:.6},{:.6},{:.6},{}",
            m.epoch,
            m.train_loss,
            m.val_loss,
            m.val_wer,
            m.skipped_updates,
        )?;

        tracing::debug!(
            "Logged epoch {} metrics: train_loss={:.4}, val_loss={:.4}, val_wer={:.4}",
            m.epoch,
            m.train_loss,
            m.val_loss,
            m.val_wer,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}
