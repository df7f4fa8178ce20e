// ============================================================
// Layer 4 — Speech Batch Collator
// ============================================================
// Turns a Vec<SpeechSample> of different lengths into one padded
// batch plus the true per-example lengths.
//
// How padding works here:
//   Input:  N samples, sample i has T_i frames and L_i labels
//   Output: features [N, 1, max T_i, feature_dim]   (pad = 0.0)
//           labels   [N, max L_i]                   (pad = label_pad)
//           feature_lengths [N] = T_i, label_lengths [N] = L_i
//
//   Each axis is padded to its own maximum. Lengths are taken
//   before padding and the batch keeps the input order; no
//   sorting or bucketing by length.
//
// Why two steps (collate, then into_batch)?
//   `collate` is plain Rust and easy to test on its own.
//   `into_batch` creates the Burn tensors on the loader's device.
//   SpeechBatcher chains the two for Burn's DataLoader.
//
// Padded label positions are never read as real symbols: the CTC
// loss is always given `label_lengths` and the decoder the model's
// true output lengths.

use burn::{data::dataloader::batcher::Batcher, prelude::*, tensor::TensorData};
use thiserror::Error;

use crate::data::dataset::SpeechSample;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollateError {
    #[error("cannot collate an empty batch")]
    Empty,

    #[error("sample {index} has feature_dim {got}, batch uses {expected}")]
    FeatureDim { index: usize, got: usize, expected: usize },
}

// ─── CollatedBatch ────────────────────────────────────────────────────────────
/// Padded batch in host memory, ready to be moved to a device.
#[derive(Debug, Clone, PartialEq)]
pub struct CollatedBatch {
    /// Row-major [batch, max_frames, feature_dim]
    pub features:        Vec<f32>,
    pub feature_lengths: Vec<usize>,
    /// Row-major [batch, max_labels]
    pub labels:          Vec<i64>,
    pub label_lengths:   Vec<usize>,
    pub transcripts:     Vec<String>,
    pub max_frames:      usize,
    pub max_labels:      usize,
    pub feature_dim:     usize,
}

impl CollatedBatch {
    pub fn batch_size(&self) -> usize {
        self.feature_lengths.len()
    }

    /// Create the device tensors for the model and the loss.
    pub fn into_batch<B: Backend>(self, device: &B::Device) -> SpeechBatch<B> {
        let batch_size = self.batch_size();

        let features = Tensor::<B, 3>::from_data(
            TensorData::new(self.features, [batch_size, self.max_frames, self.feature_dim]),
            device,
        )
        .unsqueeze_dim::<4>(1);

        let labels = Tensor::<B, 2, Int>::from_data(
            TensorData::new(self.labels, [batch_size, self.max_labels]),
            device,
        );

        SpeechBatch {
            features,
            labels,
            label_lengths:   lengths_tensor(&self.label_lengths, device),
            feature_lengths: self.feature_lengths,
            transcripts:     self.transcripts,
        }
    }
}

// ─── SpeechBatch ──────────────────────────────────────────────────────────────
/// A batch on the compute device.
#[derive(Debug, Clone)]
pub struct SpeechBatch<B: Backend> {
    /// [batch, 1, max_frames, feature_dim]
    pub features: Tensor<B, 4>,

    /// [batch, max_labels]
    pub labels: Tensor<B, 2, Int>,

    /// [batch] true label lengths
    pub label_lengths: Tensor<B, 1, Int>,

    /// True frame counts, kept on the host; the model maps them to
    /// its own output time base before they reach the loss.
    pub feature_lengths: Vec<usize>,

    /// WER references, in batch order
    pub transcripts: Vec<String>,
}

/// Host lengths → [len] Int tensor
pub fn lengths_tensor<B: Backend>(lengths: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = lengths.iter().map(|&l| l as i64).collect();
    Tensor::<B, 1, Int>::from_data(TensorData::new(values, [lengths.len()]), device)
}

/// What the DataLoader yields per batch
pub type BatchResult<B> = Result<SpeechBatch<B>, CollateError>;

// ─── SpeechBatcher ────────────────────────────────────────────────────────────
/// Burn batcher for speech samples. Holds the label padding value;
/// the device comes from the DataLoader.
#[derive(Clone, Debug)]
pub struct SpeechBatcher {
    pub label_pad: i64,
}

impl SpeechBatcher {
    pub fn new(label_pad: i64) -> Self {
        Self { label_pad }
    }
}

// ─── Burn Batcher Trait Implementation ────────────────────────────────────────
// The DataLoader calls .batch(items, device) with each mini-batch.
// A sample with the wrong feature width comes back as an Err for
// the training loop to report.
impl<B: Backend> Batcher<B, SpeechSample, BatchResult<B>> for SpeechBatcher {
    fn batch(&self, items: Vec<SpeechSample>, device: &B::Device) -> BatchResult<B> {
        collate(items, self.label_pad).map(|c| c.into_batch::<B>(device))
    }
}

// ─── collate ──────────────────────────────────────────────────────────────────
/// Pad a list of samples into one batch, preserving input order.
pub fn collate(items: Vec<SpeechSample>, label_pad: i64) -> Result<CollatedBatch, CollateError> {
    let first = items.first().ok_or(CollateError::Empty)?;
    let feature_dim = first.feature_dim;

    // ── True lengths, captured before any padding ─────────────────────────────
    let mut feature_lengths = Vec::with_capacity(items.len());
    let mut label_lengths   = Vec::with_capacity(items.len());
    for (index, s) in items.iter().enumerate() {
        if s.feature_dim != feature_dim {
            return Err(CollateError::FeatureDim { index, got: s.feature_dim, expected: feature_dim });
        }
        feature_lengths.push(s.frames());
        label_lengths.push(s.labels.len());
    }

    let max_frames = feature_lengths.iter().copied().max().unwrap_or(0);
    let max_labels = label_lengths.iter().copied().max().unwrap_or(0);
    let batch_size = items.len();

    // ── Pad each axis to its own maximum ──────────────────────────────────────
    let mut features    = vec![0.0f32; batch_size * max_frames * feature_dim];
    let mut labels      = vec![label_pad; batch_size * max_labels];
    let mut transcripts = Vec::with_capacity(batch_size);

    for (i, s) in items.into_iter().enumerate() {
        let row = i * max_frames * feature_dim;
        features[row..row + s.features.len()].copy_from_slice(&s.features);

        let row = i * max_labels;
        for (slot, &id) in labels[row..row + s.labels.len()].iter_mut().zip(&s.labels) {
            *slot = id as i64;
        }

        transcripts.push(s.transcript);
    }

    Ok(CollatedBatch {
        features,
        feature_lengths,
        labels,
        label_lengths,
        transcripts,
        max_frames,
        max_labels,
        feature_dim,
    })
}
