// ============================================================
// Layer 5 — DeepSpeech Acoustic Model
// ============================================================
// Frame-wise classifier over the alphabet, trained with CTC.
//
// Architecture (per timestep, batch-first):
//
//   features [B, 1, T, F]   F = n_mfcc * (2 * n_context + 1)
//     → reshape             [B, T, F]
//     → fc1 → clipped ReLU → dropout
//     → fc2 → clipped ReLU → dropout
//     → fc3 → clipped ReLU → dropout
//     → LSTM                [B, T, H]
//     → fc4 → clipped ReLU → dropout
//     → out                 [B, T, C]   C = alphabet size incl. blank
//     → log_softmax over C
//
// Clipped ReLU = min(max(x, 0), 20). No striding or pooling, so
// the output has one timestep per input frame.
//
// Reference: Hannun et al. (2014) Deep Speech
//            Burn Book §3 (Building Blocks)

use burn::{
    nn::{
        Dropout, DropoutConfig,
        Linear, LinearConfig,
        Lstm, LstmConfig,
    },
    prelude::*,
    tensor::activation::log_softmax,
};

use crate::data::batcher::{lengths_tensor, SpeechBatch};
use crate::ml::ctc::CtcLoss;

/// Upper bound of the clipped ReLU
const RELU_CLIP: f64 = 20.0;

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct DeepSpeechConfig {
    /// Width of one (context-stacked) input frame
    pub n_features: usize,
    /// Output classes, blank included
    pub n_classes:  usize,
    #[config(default = 1024)]
    pub n_hidden:   usize,
    #[config(default = 0.0)]
    pub dropout:    f64,
}

impl DeepSpeechConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DeepSpeech<B> {
        let h = self.n_hidden;
        DeepSpeech {
            fc1:     LinearConfig::new(self.n_features, h).init(device),
            fc2:     LinearConfig::new(h, h).init(device),
            fc3:     LinearConfig::new(h, 2 * h).init(device),
            lstm:    LstmConfig::new(2 * h, h, true).init(device),
            fc4:     LinearConfig::new(h, h).init(device),
            out:     LinearConfig::new(h, self.n_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct DeepSpeech<B: Backend> {
    pub fc1:     Linear<B>,
    pub fc2:     Linear<B>,
    pub fc3:     Linear<B>,
    pub lstm:    Lstm<B>,
    pub fc4:     Linear<B>,
    pub out:     Linear<B>,
    pub dropout: Dropout,
}

/// Everything one forward + loss pass produces
pub struct CtcOutput<B: Backend> {
    /// [batch, time, classes]
    pub log_probs:      Tensor<B, 3>,
    /// Raw per-utterance CTC losses, [batch]
    pub per_sample:     Tensor<B, 1>,
    /// Mean of per-sample losses, each divided by its target length
    pub loss:           Tensor<B, 1>,
    pub output_lengths: Vec<usize>,
}

impl<B: Backend> DeepSpeech<B> {
    /// features: [batch, 1, time, n_features] → log-probs [batch, time, classes]
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, _, time, width] = features.dims();
        let x = features.reshape([batch, time, width]);

        let x = self.dense(&self.fc1, x);
        let x = self.dense(&self.fc2, x);
        let x = self.dense(&self.fc3, x);

        let (x, _state) = self.lstm.forward(x, None);

        let x = self.dense(&self.fc4, x);
        log_softmax(self.out.forward(x), 2)
    }

    fn dense(&self, layer: &Linear<B>, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = layer.forward(x).clamp(0.0, RELU_CLIP);
        self.dropout.forward(x)
    }

    /// Valid output timesteps per example. One output per input frame.
    pub fn output_lengths(&self, feature_lengths: &[usize]) -> Vec<usize> {
        feature_lengths.to_vec()
    }

    /// Forward pass plus CTC loss, mean reduction normalised by
    /// target lengths.
    pub fn forward_ctc(&self, batch: &SpeechBatch<B>, ctc: &CtcLoss) -> CtcOutput<B> {
        let log_probs      = self.forward(batch.features.clone());
        let output_lengths = self.output_lengths(&batch.feature_lengths);
        let device         = log_probs.device();

        let input_lengths = lengths_tensor::<B>(&output_lengths, &device);

        // CtcLoss wants [time, batch, classes]
        let per_sample = ctc.forward(
            log_probs.clone().swap_dims(0, 1),
            batch.labels.clone(),
            input_lengths,
            batch.label_lengths.clone(),
        );

        // An empty transcript divides by zero here; the gate rejects the
        // resulting non-finite loss.
        let loss = per_sample
            .clone()
            .div(batch.label_lengths.clone().float())
            .mean();

        CtcOutput { log_probs, per_sample, loss, output_lengths }
    }
}
