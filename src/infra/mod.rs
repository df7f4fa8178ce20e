// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Cross-cutting concerns that don't belong to one business layer:
//
//   checkpoint.rs   — Training state persistence
//                     Atomic temp-write + rename of the full
//                     TrainingState, best-model copy, and the
//                     train_config.json the evaluate command
//                     rebuilds the model from.
//
//   metrics.rs      — Running loss and the per-epoch CSV log
//
//   distributed.rs  — Replica launcher and the in-process
//                     all-reduce collective
//
// Reference: Rust Book §7 (Modules)
//            Rust Book §9 (Error Handling with anyhow)
//            Rust Book §16 (Fearless Concurrency)

/// Training state checkpoints
pub mod checkpoint;

/// Training metrics accumulators and CSV logger
pub mod metrics;

/// Replica threads and gradient all-reduce
pub mod distributed;
