// ============================================================
// Layer 3 — Word Error Scorer
// ============================================================
// Word-level Levenshtein distance between a decoded hypothesis
// and its reference transcript.
//
//   WER = (substitutions + insertions + deletions) / reference words
//
// The scorer only returns the two sums for a batch. Dividing is
// left to the caller so that numerators and denominators can be
// summed across batches first: averaging per-batch ratios would
// give a short batch the same weight as a long one.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScoreError {
    #[error("got {hypotheses} hypotheses for {references} references")]
    LengthMismatch { hypotheses: usize, references: usize },
}

/// Edit operations and reference word count for one or more pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WerCounts {
    pub errors: usize,
    pub words:  usize,
}

impl WerCounts {
    /// errors / words, or None when there were no reference words
    pub fn rate(&self) -> Option<f64> {
        (self.words > 0).then(|| self.errors as f64 / self.words as f64)
    }
}

impl std::ops::AddAssign for WerCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.errors += rhs.errors;
        self.words  += rhs.words;
    }
}

/// Minimum number of word insertions, deletions and substitutions
/// that turn `hypothesis` into `reference`.
pub fn word_edit_distance(hypothesis: &str, reference: &str) -> usize {
    let hyp: Vec<&str> = hypothesis.split_whitespace().collect();
    let refw: Vec<&str> = reference.split_whitespace().collect();

    // Two rolling rows of the DP table: prev = row i-1, cur = row i
    let mut prev: Vec<usize> = (0..=hyp.len()).collect();
    let mut cur             = vec![0usize; hyp.len() + 1];

    for (i, r) in refw.iter().enumerate() {
        cur[0] = i + 1;
        for (j, h) in hyp.iter().enumerate() {
            let substitution = prev[j] + usize::from(r != h);
            let deletion     = prev[j + 1] + 1;
            let insertion    = cur[j] + 1;
            cur[j + 1] = substitution.min(deletion).min(insertion);
        }
        std::mem::swap(&mut prev, &mut cur);
    }

    prev[hyp.len()]
}

/// Score an order-aligned batch of hypotheses against references.
pub fn score_batch<H, R>(hypotheses: &[H], references: &[R]) -> Result<WerCounts, ScoreError>
where
    H: AsRef<str>,
    R: AsRef<str>,
{
    if hypotheses.len() != references.len() {
        return Err(ScoreError::LengthMismatch {
            hypotheses: hypotheses.len(),
            references: references.len(),
        });
    }

    let mut counts = WerCounts::default();
    for (hyp, reference) in hypotheses.iter().zip(references) {
        counts += WerCounts {
            errors: word_edit_distance(hyp.as_ref(), reference.as_ref()),
            words:  reference.as_ref().split_whitespace().count(),
        };
    }
    Ok(counts)
}
