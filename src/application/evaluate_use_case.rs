// ============================================================
// Layer 2 — EvaluateUseCase
// ============================================================
// Scores a saved checkpoint on the validation set.
//
//   Step 1: Load train_config.json     (Layer 6 - infra)
//   Step 2: Load the checkpoint        (Layer 6 - infra)
//   Step 3: Rebuild the model          (Layer 5 - ml)
//   Step 4: Build the validation set   (Layer 4 - data)
//   Step 5: One validation pass        (Layer 5 - ml)
//
// The model is built on MyInnerBackend: no autodiff, no dropout.

use std::sync::Arc;

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;

use crate::application::train_use_case::load_datasets;
use crate::domain::alphabet::Alphabet;
use crate::infra::checkpoint::CheckpointManager;
use crate::ml::{
    model::DeepSpeech,
    record::model_from_bytes,
    trainer::{evaluate, MyInnerBackend, Pipeline},
};

/// Result of one evaluation pass
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub epoch:      usize,
    pub utterances: usize,
    pub loss:       f64,
    pub wer:        f64,
    pub skipped:    usize,
}

pub struct EvaluateUseCase {
    checkpoints: CheckpointManager,
    use_best:    bool,
    batch_size:  Option<usize>,
}

impl EvaluateUseCase {
    pub fn new(checkpoint_path: String, best_path: String, use_best: bool, batch_size: Option<usize>) -> Self {
        Self {
            checkpoints: CheckpointManager::new(checkpoint_path, best_path),
            use_best,
            batch_size,
        }
    }

    pub fn execute(&self) -> Result<EvaluationReport> {
        // ── Step 1: run configuration ──
        let cfg = self.checkpoints.load_config()?;

        // ── Step 2: training state ──
        let state = if self.use_best {
            self.checkpoints.load_best()
        } else {
            self.checkpoints.load()
        }
        .context("Cannot load checkpoint. Have you run 'train' first?")?;
        tracing::info!("Loaded checkpoint from epoch {} (best loss {:.4})", state.epoch, state.best_loss);

        // ── Step 3: model ──
        let alphabet = Alphabet::english();
        let device   = burn::backend::wgpu::WgpuDevice::default();
        let model: DeepSpeech<MyInnerBackend> = cfg.model_config(alphabet.len()).init(&device);
        let model = model_from_bytes::<MyInnerBackend, _>(model, state.model_state, &device)
            .context("Checkpoint does not match the model in train_config.json")?;

        // ── Step 4: validation set ──
        let (_, val) = load_datasets(&cfg, &alphabet)?;
        let val      = Arc::new(val);

        // ── Step 5: one pass ──
        let pipe        = Pipeline::new(&alphabet);
        let batch_size  = self.batch_size.unwrap_or(cfg.batch_size);
        let (loss, wer) = evaluate(&model, &val, &pipe, batch_size, cfg.num_workers, &device)?;

        Ok(EvaluationReport {
            epoch:      state.epoch,
            utterances: val.len(),
            loss:       loss.mean().unwrap_or(f64::NAN),
            wer:        wer.rate().unwrap_or(f64::NAN),
            skipped:    loss.skipped(),
        })
    }
}
