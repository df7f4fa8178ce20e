// ============================================================
// Layer 3 — Utterance Domain Type
// ============================================================
// One transcribed recording after the acoustic front-end has
// turned its audio into a frame-by-frame feature matrix.
//
// Features are stored row-major: frame 0's coefficients, then
// frame 1's, and so on. `feature_dim` is the row width.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    /// LibriSpeech-style id, e.g. "84-121123-0000"
    pub id: String,

    /// Reference transcript, as published with the corpus
    pub transcript: String,

    /// Row-major [frames, feature_dim] feature matrix
    pub features: Vec<f32>,

    pub feature_dim: usize,
}

impl Utterance {
    pub fn new(
        id:          impl Into<String>,
        transcript:  impl Into<String>,
        features:    Vec<f32>,
        feature_dim: usize,
    ) -> Self {
        Self {
            id:         id.into(),
            transcript: transcript.into(),
            features,
            feature_dim,
        }
    }

    /// Number of feature frames (time steps)
    pub fn frames(&self) -> usize {
        if self.feature_dim == 0 {
            0
        } else {
            self.features.len() / self.feature_dim
        }
    }
}
