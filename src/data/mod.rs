// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from feature manifests on disk to padded batches.
//
//   <subset>.jsonl
//       │
//       ▼
//   ManifestLoader    → Utterance (MFCC frames + transcript)
//       │
//       ▼
//   SpeechDataset     → context stacking + label encoding
//       │
//       ▼
//   ShardSampler      → this replica's shuffled indices for the epoch
//       │
//       ▼
//   ShardDataset      → the dataset seen through those indices
//       │
//       ▼
//   DataLoader        → SpeechBatcher: padding + lengths → Burn tensors
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Reads `<datadir>/<subset>.jsonl` feature manifests
pub mod loader;

/// Stacks neighbouring frames into each input row
pub mod context;

/// Implements Burn's Dataset trait for encoded speech samples
pub mod dataset;

/// Pads variable-length samples into a batch
pub mod batcher;

/// Per-replica shuffled shards with drop_last batching
pub mod sampler;

/// Seeded train/validation split
pub mod splitter;
