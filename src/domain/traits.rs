// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// Seams between the training core and its collaborators.
//
// The acoustic front-end (spectrogram / MFCC extraction) and the
// corpus download live outside this crate. Whatever produces the
// features only has to implement UtteranceSource; the rest of the
// pipeline never sees where the numbers came from.
//
// Contract for implementations:
//   - every feature value is finite
//   - every utterance of one source has the same feature_dim
//   - frame counts are in the model's input time base

use crate::domain::utterance::Utterance;

/// Anything that can yield transcribed feature matrices for a
/// named corpus subset (e.g. "train-clean-100", "dev-clean").
pub trait UtteranceSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn load_subset(&self, subset: &str) -> Result<Vec<Utterance>, Self::Error>;

    /// Load and concatenate several subsets, in order.
    fn load_subsets(&self, subsets: &[String]) -> Result<Vec<Utterance>, Self::Error> {
        let mut all = Vec::new();
        for subset in subsets {
            all.extend(self.load_subset(subset)?);
        }
        Ok(all)
    }
}
