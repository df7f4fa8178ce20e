// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Per-replica epoch loop, driven as a small state machine:
//
//   Idle
//    └─▶ Training(e) ──leader──▶ Validating(e) ─▶ Checkpointing(e) ─┐
//          │  ▲                                                    │
//          │  └────────────── e < epochs ◀─────────────────────────┤
//          └──other ranks──▶ (next epoch)                           │
//                                             e = epochs ─▶ Done ◀──┘
//
// Training (every replica, own shard):
//   forward → CTC loss → gate
//     valid   → backward → OptimizerStep (sync → clip → update)
//     invalid → no backward; OptimizerStep still joins the sync
//   every `log_steps` batches: greedy-decode the batch and log
//   loss + interim WER
//
// Validating (leader only): model.valid() on MyInnerBackend,
//   no autodiff, every validation utterance once.
//
// Checkpointing (leader only): is_best = finite val_loss below the
//   best so far; write TrainingState atomically; append metrics.
//
// Key Burn 0.20 insight:
//   - Training uses MyBackend (Autodiff<Wgpu>) for gradients
//   - model.valid() returns the model on MyInnerBackend (Wgpu)
//   - Validation batches must also be built on MyInnerBackend
//
// Reference: Burn Book §5, Graves et al. (2006) CTC

use std::sync::Arc;

use anyhow::{Context, Result};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::application::train_use_case::TrainConfig;
use crate::data::{
    batcher::{BatchResult, SpeechBatcher},
    dataset::{ShardDataset, SpeechDataset},
    sampler::ShardSampler,
};
use crate::domain::{
    alphabet::Alphabet,
    wer::{score_batch, WerCounts},
};
use crate::infra::{
    checkpoint::{CheckpointManager, TrainingState},
    distributed::{scaled_learning_rate, ReplicaContext},
    metrics::{EpochMetrics, MetricsLogger, RunningLoss},
};
use crate::ml::{
    ctc::{CtcLoss, CtcLossConfig},
    decoder::GreedyDecoder,
    gate::{check_loss, LossCheck},
    model::DeepSpeech,
    optim::OptimizerStep,
    record::{model_from_bytes, model_to_bytes, optimizer_from_bytes, optimizer_to_bytes},
};

pub type MyBackend      = burn::backend::Autodiff<burn::backend::Wgpu>;
pub type MyInnerBackend = burn::backend::Wgpu;

// ─── Phase ────────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Training { epoch: usize },
    Validating { epoch: usize },
    Checkpointing { epoch: usize },
    Done,
}

impl Phase {
    /// First phase after Idle
    pub fn start(first_epoch: usize, epochs: usize) -> Self {
        if first_epoch > epochs { Self::Done } else { Self::Training { epoch: first_epoch } }
    }

    /// Leader validates; every other replica moves straight on.
    pub fn after_training(epoch: usize, epochs: usize, is_leader: bool) -> Self {
        if is_leader { Self::Validating { epoch } } else { Self::after_epoch(epoch, epochs) }
    }

    pub fn after_epoch(epoch: usize, epochs: usize) -> Self {
        Self::start(epoch + 1, epochs)
    }
}

// ─── Inputs / outputs ─────────────────────────────────────────────────────────
/// Datasets shared read-only by every replica
pub struct TrainingData {
    pub train:    Arc<SpeechDataset>,
    pub val:      Arc<SpeechDataset>,
    pub alphabet: Alphabet,
}

/// Where a (possibly resumed) run starts
#[derive(Debug, Clone)]
pub struct StartPoint {
    pub first_epoch:     usize,
    pub best_loss:       f64,
    pub optimizer_state: Option<Vec<u8>>,
}

impl StartPoint {
    pub fn fresh() -> Self {
        Self { first_epoch: 1, best_loss: f64::INFINITY, optimizer_state: None }
    }

    pub fn resumed(state: &TrainingState) -> Self {
        Self {
            first_epoch:     state.epoch + 1,
            best_loss:       state.best_loss,
            optimizer_state: Some(state.optimizer_state.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaSummary {
    pub rank:      usize,
    pub best_loss: f64,
    /// Filled on the leader only
    pub history:   Vec<EpochMetrics>,
}

/// What every batch is pushed through
pub struct Pipeline<'a> {
    pub ctc:       CtcLoss,
    pub decoder:   GreedyDecoder,
    pub alphabet:  &'a Alphabet,
    pub label_pad: i64,
}

impl<'a> Pipeline<'a> {
    /// Labels are padded with the blank ID: in range for the CTC
    /// gather and masked out by the label lengths.
    pub fn new(alphabet: &'a Alphabet) -> Self {
        let blank = alphabet.blank_id();
        Self {
            ctc:       CtcLossConfig::new().with_blank(blank).init(),
            decoder:   GreedyDecoder::new(blank),
            alphabet,
            label_pad: blank as i64,
        }
    }
}

// ─── run_replica ──────────────────────────────────────────────────────────────
/// Train one replica from the template parameter blob.
pub fn run_replica<B, O>(
    ctx:      &ReplicaContext,
    cfg:      &TrainConfig,
    data:     &TrainingData,
    template: &[u8],
    optim:    O,
    start:    &StartPoint,
    device:   &B::Device,
) -> Result<ReplicaSummary>
where
    B: AutodiffBackend,
    O: Optimizer<DeepSpeech<B>, B>,
{
    // ── Model from the shared template ──
    let model: DeepSpeech<B> = cfg.model_config(data.alphabet.len()).init(device);
    let mut model = model_from_bytes::<B, _>(model, template.to_vec(), device)
        .with_context(|| format!("Replica {} cannot load the template parameters", ctx.rank))?;

    // ── Optimizer (restored when resuming) ──
    let optim = match &start.optimizer_state {
        Some(bytes) => optimizer_from_bytes::<B, DeepSpeech<B>, O>(optim, bytes.clone(), device)
            .context("Cannot restore optimizer state")?,
        None => optim,
    };
    let mut step = match &ctx.collective {
        Some(c) => OptimizerStep::synchronized(optim, cfg.max_grad_norm, ctx.rank, Arc::clone(c)),
        None    => OptimizerStep::local(optim, cfg.max_grad_norm),
    };

    // ── Linear LR scaling ──
    let lr = scaled_learning_rate(cfg.learning_rate, ctx.world_size);

    let pipe    = Pipeline::new(&data.alphabet);
    let sampler = ShardSampler::new(data.train.len(), ctx.world_size, ctx.rank, cfg.seed);
    let steps   = sampler.steps_per_epoch(cfg.batch_size);
    if steps == 0 {
        tracing::warn!(
            "{} training utterances are fewer than one batch per replica ({} x {}); no updates will happen",
            data.train.len(), ctx.world_size, cfg.batch_size,
        );
    }

    // Leader-only sinks
    let sinks = if ctx.is_leader() {
        let checkpoints = CheckpointManager::new(&cfg.checkpoint_path, &cfg.best_path);
        let logger      = MetricsLogger::new(&cfg.logdir)?;
        Some((checkpoints, logger))
    } else {
        None
    };

    tracing::info!(
        "Replica {}/{}: {} steps/epoch, lr={:.2e}, epochs {}..={}",
        ctx.rank, ctx.world_size, steps, lr, start.first_epoch, cfg.epochs,
    );

    let mut best_loss  = start.best_loss;
    let mut history    = Vec::new();
    let mut train_loss = RunningLoss::default();
    let mut val_loss   = RunningLoss::default();
    let mut val_wer    = WerCounts::default();

    let mut phase = Phase::Idle;
    loop {
        phase = match phase {
            Phase::Idle => Phase::start(start.first_epoch, cfg.epochs),

            Phase::Training { epoch } => {
                let shard  = ShardDataset::new(Arc::clone(&data.train), sampler.epoch_indices(epoch, cfg.batch_size));
                let loader = build_loader::<B>(shard, &pipe, cfg.batch_size, cfg.num_workers, device);

                let (trained, loss) = train_epoch(model, &mut step, loader.iter(), &pipe, lr, cfg.log_steps, epoch, ctx.rank)?;
                model      = trained;
                train_loss = loss;

                tracing::info!(
                    "Replica {} epoch {:>3}/{} | train_loss={:.4} | skipped={}",
                    ctx.rank, epoch, cfg.epochs,
                    train_loss.mean().unwrap_or(f64::NAN), train_loss.skipped(),
                );
                Phase::after_training(epoch, cfg.epochs, ctx.is_leader())
            }

            Phase::Validating { epoch } => {
                // model.valid() → DeepSpeech<B::InnerBackend>, dropout disabled
                let (loss, wer) = evaluate(&model.valid(), &data.val, &pipe, cfg.batch_size, cfg.num_workers, device)?;
                val_loss = loss;
                val_wer  = wer;
                tracing::debug!("Validated epoch {} on {} batches", epoch, val_loss.iterations());
                Phase::Checkpointing { epoch }
            }

            Phase::Checkpointing { epoch } => {
                let metrics = EpochMetrics::new(epoch, &train_loss, &val_loss, val_wer);
                let is_best = metrics.is_improvement(best_loss);
                if is_best {
                    best_loss = metrics.val_loss;
                }

                if let Some((checkpoints, logger)) = &sinks {
                    let state = TrainingState {
                        epoch,
                        best_loss,
                        model_state:     model_to_bytes::<B, _>(&model)?,
                        optimizer_state: optimizer_to_bytes::<B, DeepSpeech<B>, O>(step.optimizer())?,
                    };
                    checkpoints
                        .save(&state, is_best)
                        .with_context(|| format!("Cannot save checkpoint for epoch {epoch}"))?;
                    logger.log(&metrics)?;
                }

                println!(
                    "Epoch {:>3}/{} | train_loss={:.4} | val_loss={:.4} | val_wer={:.2}%{}",
                    epoch, cfg.epochs, metrics.train_loss, metrics.val_loss,
                    metrics.val_wer * 100.0,
                    if is_best { " | best" } else { "" },
                );
                history.push(metrics);
                Phase::after_epoch(epoch, cfg.epochs)
            }

            Phase::Done => break,
        };
    }

    tracing::info!("Replica {} finished", ctx.rank);
    Ok(ReplicaSummary { rank: ctx.rank, best_loss, history })
}

// ─── Data loader ──────────────────────────────────────────────────────────────
/// Burn DataLoader over `dataset` in the dataset's own order.
/// workers = 0 batches on the calling thread; otherwise a single
/// background worker, since several would interleave batches.
fn build_loader<B: Backend>(
    dataset:    ShardDataset,
    pipe:       &Pipeline<'_>,
    batch_size: usize,
    workers:    usize,
    device:     &B::Device,
) -> Arc<dyn DataLoader<B, BatchResult<B>>> {
    let builder = DataLoaderBuilder::<B, _, BatchResult<B>>::new(SpeechBatcher::new(pipe.label_pad))
        .batch_size(batch_size.max(1))
        .set_device(device.clone());
    let builder = if workers > 0 { builder.num_workers(1) } else { builder };
    builder.build(dataset)
}

// ─── Training epoch ───────────────────────────────────────────────────────────
#[allow(clippy::too_many_arguments)]
fn train_epoch<B, O>(
    mut model: DeepSpeech<B>,
    step:      &mut OptimizerStep<O>,
    batches:   impl Iterator<Item = BatchResult<B>>,
    pipe:      &Pipeline<'_>,
    lr:        f64,
    log_steps: usize,
    epoch:     usize,
    rank:      usize,
) -> Result<(DeepSpeech<B>, RunningLoss)>
where
    B: AutodiffBackend,
    O: Optimizer<DeepSpeech<B>, B>,
{
    let mut running = RunningLoss::default();

    for (i, batch) in batches.enumerate() {
        let batch = batch.with_context(|| format!("Cannot collate training batch {}", i + 1))?;
        let out   = model.forward_ctc(&batch, &pipe.ctc);

        let loss_value: f64      = out.loss.clone().into_scalar().elem::<f64>();
        let per_sample: Vec<f32> = out.per_sample.clone().into_data().iter::<f32>().collect();

        // ── Gate: only a valid loss is back-propagated ──
        let grads = match check_loss(loss_value, &per_sample) {
            LossCheck::Valid => {
                running.add(loss_value);
                Some(GradientsParams::from_grads(out.loss.backward(), &model))
            }
            LossCheck::Invalid(cause) => {
                tracing::warn!(
                    "Replica {} epoch {} step {}: {}, skipping update",
                    rank, epoch, i + 1, cause,
                );
                running.add_skipped();
                None
            }
        };

        if log_steps > 0 && (i + 1) % log_steps == 0 {
            let wer = batch_wer(pipe, out.log_probs.inner(), &out.output_lengths, &batch.transcripts)?;
            tracing::info!(
                "Replica {} epoch {} step {} | loss={:.4} | avg_loss={:.4} | wer={:.4}",
                rank, epoch, i + 1, loss_value,
                running.mean().unwrap_or(f64::NAN),
                wer.rate().unwrap_or(f64::NAN),
            );
        }

        let (next, _outcome) = step.apply::<B, DeepSpeech<B>>(lr, model, grads)?;
        model = next;
    }

    Ok((model, running))
}

/// Greedy-decode one batch and score it against its transcripts.
fn batch_wer<B: Backend>(
    pipe:       &Pipeline<'_>,
    log_probs:  Tensor<B, 3>,
    lengths:    &[usize],
    references: &[String],
) -> Result<WerCounts> {
    let hypotheses = pipe.decoder.transcribe(log_probs, lengths, pipe.alphabet)?;
    if let (Some(hyp), Some(reference)) = (hypotheses.first(), references.first()) {
        tracing::debug!("hyp: {:?}", hyp);
        tracing::debug!("ref: {:?}", reference);
    }
    Ok(score_batch(&hypotheses, references)?)
}

// ─── Evaluation ───────────────────────────────────────────────────────────────
/// One pass over `dataset` in order, final partial batch kept.
/// Returns the running loss (rejected losses count as zero) and
/// the accumulated word errors.
pub fn evaluate<B: Backend>(
    model:      &DeepSpeech<B>,
    dataset:    &Arc<SpeechDataset>,
    pipe:       &Pipeline<'_>,
    batch_size: usize,
    workers:    usize,
    device:     &B::Device,
) -> Result<(RunningLoss, WerCounts)> {
    let loader = build_loader::<B>(ShardDataset::whole(Arc::clone(dataset)), pipe, batch_size, workers, device);

    let mut loss = RunningLoss::default();
    let mut wer  = WerCounts::default();

    for (i, batch) in loader.iter().enumerate() {
        let batch = batch.with_context(|| format!("Cannot collate validation batch {}", i + 1))?;
        let out   = model.forward_ctc(&batch, &pipe.ctc);

        let value: f64           = out.loss.into_scalar().elem::<f64>();
        let per_sample: Vec<f32> = out.per_sample.into_data().iter::<f32>().collect();
        match check_loss(value, &per_sample) {
            LossCheck::Valid => loss.add(value),
            LossCheck::Invalid(cause) => {
                tracing::warn!("Validation batch {}: {}", i + 1, cause);
                loss.add_skipped();
            }
        }

        wer += batch_wer(pipe, out.log_probs, &out.output_lengths, &batch.transcripts)?;
    }

    Ok((loss, wer))
}
