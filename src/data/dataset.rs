use std::sync::Arc;

use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};

use crate::data::context::{stack_context, stacked_dim};
use crate::data::loader::DatasetError;
use crate::domain::alphabet::{Alphabet, VocabularyError};
use crate::domain::utterance::Utterance;

/// One model-ready example: context-stacked features plus the
/// encoded transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechSample {
    /// Row-major [frames, feature_dim]
    pub features:    Vec<f32>,
    pub feature_dim: usize,
    pub labels:      Vec<usize>,
    /// Lower-cased transcript, used as the WER reference
    pub transcript:  String,
}

impl SpeechSample {
    pub fn frames(&self) -> usize {
        if self.feature_dim == 0 { 0 } else { self.features.len() / self.feature_dim }
    }

    pub fn from_utterance(
        utt:       &Utterance,
        alphabet:  &Alphabet,
        n_context: usize,
    ) -> Result<Self, VocabularyError> {
        let labels = alphabet.text_to_int(&utt.transcript)?;
        Ok(Self {
            features:    stack_context(&utt.features, utt.feature_dim, n_context),
            feature_dim: stacked_dim(utt.feature_dim, n_context),
            labels,
            transcript:  utt.transcript.to_lowercase(),
        })
    }
}

#[derive(Debug)]
pub struct SpeechDataset {
    samples: Vec<SpeechSample>,
}

impl SpeechDataset {
    pub fn new(samples: Vec<SpeechSample>) -> Self { Self { samples } }

    /// Encode every utterance. The first transcript with a character
    /// outside the alphabet aborts the build.
    pub fn from_utterances(
        utterances: &[Utterance],
        alphabet:   &Alphabet,
        n_context:  usize,
    ) -> Result<Self, DatasetError> {
        let samples = utterances
            .iter()
            .map(|u| {
                SpeechSample::from_utterance(u, alphabet, n_context).map_err(|source| {
                    DatasetError::Transcript { id: u.id.clone(), source }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(samples))
    }

    pub fn total_frames(&self) -> usize {
        self.samples.iter().map(SpeechSample::frames).sum()
    }
}

impl Dataset<SpeechSample> for SpeechDataset {
    fn get(&self, index: usize) -> Option<SpeechSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

// ─── ShardDataset ─────────────────────────────────────────────────────────────
/// A view of a shared SpeechDataset in a fixed index order: one
/// replica's shard for one epoch, or the whole set for validation.
#[derive(Debug, Clone)]
pub struct ShardDataset {
    inner:   Arc<SpeechDataset>,
    indices: Vec<usize>,
}

impl ShardDataset {
    pub fn new(inner: Arc<SpeechDataset>, indices: Vec<usize>) -> Self {
        Self { inner, indices }
    }

    /// Every sample, in dataset order
    pub fn whole(inner: Arc<SpeechDataset>) -> Self {
        let indices = (0..inner.len()).collect();
        Self { inner, indices }
    }
}

impl Dataset<SpeechSample> for ShardDataset {
    fn get(&self, index: usize) -> Option<SpeechSample> {
        self.indices.get(index).and_then(|&i| self.inner.get(i))
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_from_utterance() {
        let a   = Alphabet::english();
        let utt = Utterance::new("1-1-0", "HI YA", vec![1.0, 2.0, 3.0], 1);
        let s   = SpeechSample::from_utterance(&utt, &a, 1).unwrap();
        assert_eq!(s.feature_dim, 3);
        assert_eq!(s.frames(), 3);
        assert_eq!(s.labels.len(), 5);
        assert_eq!(s.transcript, "hi ya");
    }

    #[test]
    fn test_dataset_reports_offending_utterance() {
        let a    = Alphabet::english();
        let good = Utterance::new("ok", "fine", vec![0.0], 1);
        let bad  = Utterance::new("bad", "n0pe", vec![0.0], 1);
        let err  = SpeechDataset::from_utterances(&[good, bad], &a, 0).unwrap_err();
        match err {
            DatasetError::Transcript { id, source } => {
                assert_eq!(id, "bad");
                assert!(matches!(source, VocabularyError::UnknownChar { ch: '0', .. }));
            }
            other => panic!("expected a transcript error, got {other}"),
        }
    }

    #[test]
    fn test_dataset_trait() {
        let a  = Alphabet::english();
        let ds = SpeechDataset::from_utterances(
            &[Utterance::new("x", "a", vec![0.0; 4], 2)],
            &a,
            0,
        )
        .unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.total_frames(), 2);
        assert!(ds.get(1).is_none());
    }

    #[test]
    fn test_shard_follows_its_indices() {
        let a  = Alphabet::english();
        let ds = Arc::new(
            SpeechDataset::from_utterances(
                &[
                    Utterance::new("0", "a", vec![0.0], 1),
                    Utterance::new("1", "b", vec![0.0], 1),
                    Utterance::new("2", "c", vec![0.0], 1),
                ],
                &a,
                0,
            )
            .unwrap(),
        );

        let shard = ShardDataset::new(Arc::clone(&ds), vec![2, 0]);
        assert_eq!(shard.len(), 2);
        assert_eq!(shard.get(0).unwrap().transcript, "c");
        assert_eq!(shard.get(1).unwrap().transcript, "a");
        assert!(shard.get(2).is_none());

        let whole = ShardDataset::whole(ds);
        assert_eq!(whole.len(), 3);
        assert_eq!(whole.get(1).unwrap().transcript, "b");
    }
}
