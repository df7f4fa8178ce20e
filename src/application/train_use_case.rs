// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Load feature manifests    (Layer 4 - data)
//   Step 2: Train / validation sets   (Layer 4 - data)
//   Step 3: Encode + stack context    (Layer 4 - data)
//   Step 4: Template parameters       (Layer 5 - ml)
//            fresh init, or the checkpoint when resuming
//   Step 5: Save config               (Layer 6 - infra)
//   Step 6: Launch replicas           (Layer 6 - infra)
//            each runs the training loop (Layer 5 - ml)
//
// Reference: Rust Book §13 (Iterators and Closures)
//            Burn Book §5 (Training)

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use burn::{
    optim::{momentum::MomentumConfig, AdamConfig, Optimizer, SgdConfig},
    prelude::*,
};
use serde::{Deserialize, Serialize};

use crate::data::{
    context::stacked_dim,
    dataset::SpeechDataset,
    loader::ManifestLoader,
    splitter::split_train_val,
};
use crate::domain::{alphabet::Alphabet, traits::UtteranceSource, utterance::Utterance};
use crate::infra::{
    checkpoint::CheckpointManager,
    distributed::{launch, SUPPORTED_WORLD_SIZES},
};
use crate::ml::{
    model::{DeepSpeech, DeepSpeechConfig},
    record::model_to_bytes,
    trainer::{run_replica, MyBackend, ReplicaSummary, StartPoint, TrainingData},
};

// ─── Training Configuration ──────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

// All hyperparameters for a training run.
// Serialisable so it can be saved next to the checkpoint and
// reloaded by `evaluate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub world_size:        usize,
    /// Batches collated ahead of compute; 0 = inline
    pub num_workers:       usize,
    pub batch_size:        usize,
    pub window_length_ms:  f64,
    pub window_stride_ms:  f64,
    pub n_mfcc:            usize,
    pub n_context:         usize,
    pub optimizer:         OptimizerKind,
    /// Per-replica rate; the effective rate is this × world_size
    pub learning_rate:     f64,
    pub momentum:          f64,
    pub epochs:            usize,
    pub checkpoint_path:   String,
    pub best_path:         String,
    pub datadir:           String,
    pub train_subsets:     Vec<String>,
    /// Empty → hold back (1 - train_fraction) of the training set
    pub val_subsets:       Vec<String>,
    pub train_fraction:    f64,
    pub log_steps:         usize,
    pub logdir:            String,
    pub seed:              u64,
    pub max_grad_norm:     f64,
    pub n_hidden:          usize,
    pub dropout:           f64,
    pub sync_timeout_secs: u64,
    #[serde(skip)]
    pub resume:            bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            world_size:        1,
            num_workers:       4,
            batch_size:        32,
            window_length_ms:  20.0,
            window_stride_ms:  20.0,
            n_mfcc:            26,
            n_context:         9,
            optimizer:         OptimizerKind::Adam,
            learning_rate:     3e-4,
            momentum:          0.9,
            epochs:            10,
            checkpoint_path:   "deepspeech.pth".to_string(),
            best_path:         "model_best.pth".to_string(),
            datadir:           "/tmp/librispeech".to_string(),
            train_subsets:     vec!["train-clean-100".to_string()],
            val_subsets:       vec!["dev-clean".to_string()],
            train_fraction:    0.8,
            log_steps:         100,
            logdir:            "logs".to_string(),
            seed:              200,
            max_grad_norm:     400.0,
            n_hidden:          1024,
            dropout:           0.0,
            sync_timeout_secs: 1800,
            resume:            false,
        }
    }
}

impl TrainConfig {
    /// Model architecture for an alphabet of `n_classes` symbols
    pub fn model_config(&self, n_classes: usize) -> DeepSpeechConfig {
        DeepSpeechConfig::new(stacked_dim(self.n_mfcc, self.n_context), n_classes)
            .with_n_hidden(self.n_hidden)
            .with_dropout(self.dropout)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_WORLD_SIZES.contains(&self.world_size) {
            return Err(anyhow!(
                "world size {} is not supported (expected one of {:?})",
                self.world_size, SUPPORTED_WORLD_SIZES,
            ));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("batch size must be at least 1"));
        }
        if self.n_mfcc == 0 {
            return Err(anyhow!("n_mfcc must be at least 1"));
        }
        if self.train_subsets.is_empty() {
            return Err(anyhow!("at least one training subset is required"));
        }
        if self.val_subsets.is_empty() && !(0.0..1.0).contains(&self.train_fraction) {
            return Err(anyhow!("train fraction must be in [0, 1) when no validation subsets are given"));
        }
        Ok(())
    }
}

// ─── Dataset preparation ──────────────────────────────────────────────────────
/// Load, split and encode the training and validation sets.
pub fn load_datasets(cfg: &TrainConfig, alphabet: &Alphabet) -> Result<(SpeechDataset, SpeechDataset)> {
    let loader = ManifestLoader::new(&cfg.datadir, cfg.n_mfcc);

    // ── Step 1: feature manifests ──
    tracing::info!("Loading {:?} from '{}'", cfg.train_subsets, cfg.datadir);
    let train = loader
        .load_subsets(&cfg.train_subsets)
        .with_context(|| format!("Cannot load training subsets {:?}", cfg.train_subsets))?;

    // ── Step 2: validation source ──
    let (train, val): (Vec<Utterance>, Vec<Utterance>) = if cfg.val_subsets.is_empty() {
        tracing::info!("No validation subsets; holding back {:.0}% of training", (1.0 - cfg.train_fraction) * 100.0);
        split_train_val(train, cfg.train_fraction, cfg.seed)
    } else {
        let val = loader
            .load_subsets(&cfg.val_subsets)
            .with_context(|| format!("Cannot load validation subsets {:?}", cfg.val_subsets))?;
        (train, val)
    };

    // ── Step 3: label encoding + context stacking ──
    let train = SpeechDataset::from_utterances(&train, alphabet, cfg.n_context)
        .context("Cannot build the training set")?;
    let val = SpeechDataset::from_utterances(&val, alphabet, cfg.n_context)
        .context("Cannot build the validation set")?;

    log_duration("train", &train, cfg);
    log_duration("validation", &val, cfg);
    Ok((train, val))
}

fn log_duration(name: &str, dataset: &SpeechDataset, cfg: &TrainConfig) {
    use burn::data::dataset::Dataset;
    let frames = dataset.total_frames();
    let hours  = frames as f64 * cfg.window_stride_ms / 1000.0 / 3600.0;
    tracing::info!(
        "{}: {} utterances, {} frames ≈ {:.2} h of audio ({} ms windows, {} ms stride)",
        name, dataset.len(), frames, hours, cfg.window_length_ms, cfg.window_stride_ms,
    );
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Execute the full training pipeline end to end. Returns the
    /// leader's summary.
    pub fn execute(&self) -> Result<ReplicaSummary> {
        let cfg = &self.config;
        cfg.validate()?;

        let alphabet     = Alphabet::english();
        let (train, val) = load_datasets(cfg, &alphabet)?;
        let data = TrainingData { train: Arc::new(train), val: Arc::new(val), alphabet };

        // ── Step 4: template parameters ──
        let device      = burn::backend::wgpu::WgpuDevice::default();
        let checkpoints = CheckpointManager::new(&cfg.checkpoint_path, &cfg.best_path);
        let fresh: DeepSpeech<MyBackend> = cfg.model_config(data.alphabet.len()).init(&device);
        tracing::info!("Model ready: {} parameters, n_hidden={}", fresh.num_params(), cfg.n_hidden);

        let (template, start) = if cfg.resume && checkpoints.exists() {
            let state = checkpoints
                .load()
                .with_context(|| format!("Cannot resume from '{}'", checkpoints.path().display()))?;
            tracing::info!("Resuming after epoch {} (best loss {:.4})", state.epoch, state.best_loss);
            let start = StartPoint::resumed(&state);
            (state.model_state, start)
        } else {
            if cfg.resume {
                tracing::warn!("No checkpoint at '{}'; starting fresh", checkpoints.path().display());
            }
            (model_to_bytes::<MyBackend, _>(&fresh)?, StartPoint::fresh())
        };

        // ── Step 5: config for evaluate ──
        checkpoints.save_config(cfg)?;

        // ── Step 6: replicas ──
        tracing::info!("Using WGPU device: {:?}", device);
        match cfg.optimizer {
            OptimizerKind::Adam => self.run_replicas(&data, &template, &start, &device, || {
                AdamConfig::new()
                    .with_epsilon(1e-8)
                    .init::<MyBackend, DeepSpeech<MyBackend>>()
            }),
            OptimizerKind::Sgd => self.run_replicas(&data, &template, &start, &device, || {
                SgdConfig::new()
                    .with_momentum(Some(MomentumConfig::new().with_momentum(cfg.momentum)))
                    .init::<MyBackend, DeepSpeech<MyBackend>>()
            }),
        }
    }

    fn run_replicas<O, F>(
        &self,
        data:       &TrainingData,
        template:   &[u8],
        start:      &StartPoint,
        device:     &<MyBackend as Backend>::Device,
        make_optim: F,
    ) -> Result<ReplicaSummary>
    where
        O: Optimizer<DeepSpeech<MyBackend>, MyBackend>,
        F: Fn() -> O + Sync,
    {
        let cfg     = &self.config;
        let timeout = Duration::from_secs(cfg.sync_timeout_secs);

        let summaries = launch(cfg.world_size, timeout, |ctx| {
            run_replica::<MyBackend, O>(&ctx, cfg, data, template, make_optim(), start, device)
        })?;

        summaries
            .into_iter()
            .find(|s| s.rank == 0)
            .ok_or_else(|| anyhow!("leader replica returned no summary"))
    }
}
