// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Pure Rust types and rules of the speech-recognition problem.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O or network calls
//   - Only plain Rust structs, enums, functions and traits
//
// Everything here is unit-testable without a GPU.

// Character ↔ label-id mapping with the CTC blank
pub mod alphabet;

// A transcribed feature matrix
pub mod utterance;

// Word-level edit distance for WER
pub mod wer;

// Collaborator seams
pub mod traits;
