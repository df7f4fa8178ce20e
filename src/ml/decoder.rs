// ============================================================
// Layer 5 — Greedy CTC Decoder
// ============================================================
// Best-path decoding of the model's per-timestep class scores.
//
//   scores [batch, time, classes]
//     → argmax over classes at each timestep   (raw path)
//     → collapse consecutive repeats           (a a _ b b → a _ b)
//     → drop blanks                            (a _ b     → a b)
//     → Alphabet::int_to_text
//
// Only the first `lengths[i]` timesteps of example i are read, so
// padded frames can never turn into characters.
//
// No beam search, no language model.

use burn::prelude::*;

use crate::domain::alphabet::{Alphabet, VocabularyError};

#[derive(Debug, Clone, Copy)]
pub struct GreedyDecoder {
    blank: usize,
}

impl GreedyDecoder {
    pub fn new(blank: usize) -> Self {
        Self { blank }
    }

    /// Collapse repeats, then remove blanks.
    pub fn collapse(&self, path: &[usize]) -> Vec<usize> {
        let mut out  = Vec::with_capacity(path.len());
        let mut prev = None;
        for &id in path {
            if prev != Some(id) && id != self.blank {
                out.push(id);
            }
            prev = Some(id);
        }
        out
    }

    /// Decode a [batch, time, classes] tensor. The argmax runs on the
    /// device; only the [batch, time] index matrix is copied back.
    pub fn decode<B: Backend>(&self, scores: Tensor<B, 3>, lengths: &[usize]) -> Vec<Vec<usize>> {
        let [batch, time, _] = scores.dims();
        let best: Vec<usize> = scores
            .argmax(2)
            .into_data()
            .iter::<i64>()
            .map(|id| id as usize)
            .collect();

        (0..batch)
            .map(|b| {
                let len = lengths.get(b).copied().unwrap_or(time).min(time);
                self.collapse(&best[b * time..b * time + len])
            })
            .collect()
    }

    /// Decode straight to text
    pub fn transcribe<B: Backend>(
        &self,
        scores:   Tensor<B, 3>,
        lengths:  &[usize],
        alphabet: &Alphabet,
    ) -> Result<Vec<String>, VocabularyError> {
        self.decode(scores, lengths)
            .iter()
            .map(|ids| alphabet.int_to_text(ids))
            .collect()
    }
}
