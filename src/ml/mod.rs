// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Everything that touches tensors, gradients or optimizers.
//
// What's in this layer:
//
//   model.rs    — DeepSpeech acoustic model
//                 clipped-ReLU dense stack + LSTM + log_softmax,
//                 forward pass fused with the CTC loss
//
//   ctc.rs      — CTC loss
//                 alpha recursion over the blank-extended labels,
//                 one negative log-likelihood per utterance
//
//   gate.rs     — Loss validity gate
//                 decides whether a loss may be back-propagated
//
//   decoder.rs  — Greedy CTC decoder
//                 best path → collapse repeats → drop blanks
//
//   optim.rs    — OptimizerStep
//                 gradient all-reduce, global-norm clipping,
//                 then the Burn optimizer update
//
//   record.rs   — Parameter / optimizer blobs
//                 NamedMpkBytesRecorder round-trips for templates
//                 and checkpoints
//
//   trainer.rs  — Per-replica training state machine,
//                 validation pass and checkpoint hand-off
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Graves et al. (2006) Connectionist Temporal Classification

/// DeepSpeech architecture and CTC forward pass
pub mod model;

/// Per-utterance CTC negative log-likelihood
pub mod ctc;

/// Rejects inf / NaN / negative losses before backward
pub mod gate;

/// Greedy best-path CTC decoding
pub mod decoder;

/// Gradient sync + clipping + optimizer update
pub mod optim;

/// In-memory model and optimizer records
pub mod record;

/// Training loop with validation and checkpointing
pub mod trainer;
