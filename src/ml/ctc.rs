// ============================================================
// Layer 5 — CTC Loss
// ============================================================
// Connectionist Temporal Classification negative log-likelihood,
// one value per utterance, built from ordinary tensor ops so the
// autodiff backend derives the gradient on its own.
//
// Forward (alpha) recursion over the blank-extended label l':
//
//   l' = [b, l1, b, l2, ..., lU, b]          width S = 2U + 1
//
//   alpha_0(0) = y_0(b)   alpha_0(1) = y_0(l1)   rest = log 0
//   alpha_t(s) = logsumexp(alpha_{t-1}(s), alpha_{t-1}(s-1)
//                          [, alpha_{t-1}(s-2) if l'(s) != b
//                                             and l'(s) != l'(s-2)])
//                + y_t(l'(s))
//
//   -log p(l|x) = -logsumexp(alpha_{T-1}(2U), alpha_{T-1}(2U-1))
//
// Per-utterance lengths are honoured with masks: a row stops
// updating once t reaches its input length, and only the first
// 2 * target_length + 1 states of a row are read at the end.
// Padded label positions are therefore never scored.
//
// log 0 is a large finite negative, so no -inf ever reaches the
// gradient. A likelihood still near that floor at the end means no alignment exists
// (more labels than frames) and the loss is reported as +inf.
//
// Reference: Graves et al. (2006), eq. 6–8

use burn::prelude::*;

/// Stand-in for log(0)
const LOG_ZERO: f32 = -1.0e30;

#[derive(Config, Debug)]
pub struct CtcLossConfig {
    /// Class index of the blank symbol
    #[config(default = 0)]
    pub blank: usize,
}

impl CtcLossConfig {
    pub fn init(&self) -> CtcLoss {
        CtcLoss { blank: self.blank }
    }
}

#[derive(Debug, Clone)]
pub struct CtcLoss {
    blank: usize,
}

impl CtcLoss {
    /// Per-utterance loss, no reduction.
    ///
    /// Shapes:
    ///   log_probs      [time, batch, classes]  (log_softmax output)
    ///   targets        [batch, max_target_len] (padding is ignored)
    ///   input_lengths  [batch]
    ///   target_lengths [batch]
    ///   → [batch]
    ///
    /// # Panics
    /// If the blank is not a valid class or the batch dimensions
    /// disagree.
    pub fn forward<B: Backend>(
        &self,
        log_probs:      Tensor<B, 3>,
        targets:        Tensor<B, 2, Int>,
        input_lengths:  Tensor<B, 1, Int>,
        target_lengths: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let device = log_probs.device();
        let [time, batch, classes] = log_probs.dims();
        let [target_batch, max_labels] = targets.dims();

        assert!(self.blank < classes, "blank {} is not among {} classes", self.blank, classes);
        assert_eq!(target_batch, batch, "targets hold {target_batch} rows for a batch of {batch}");
        assert_eq!(input_lengths.dims()[0], batch, "one input length per utterance");
        assert_eq!(target_lengths.dims()[0], batch, "one target length per utterance");

        let width    = 2 * max_labels + 1;
        let extended = interleave(targets.clone(), self.blank as i64); // [N, S]
        let skip_ok  = skip_allowed(targets);                          // [N, S]

        // s < 2 * target_length + 1
        let states = Tensor::<B, 1, Int>::arange(0..width as i64, &device)
            .reshape([1, width])
            .expand([batch, width]);
        let state_in_range = states.clone().lower(
            target_lengths.clone().mul_scalar(2).add_scalar(1).reshape([batch, 1]).expand([batch, width]),
        );

        // ── t = 0 ──
        let emit      = emissions(log_probs.clone(), 0, &extended);
        let mut alpha = Tensor::<B, 2>::full([batch, width], LOG_ZERO, &device)
            .mask_where(states.lower_elem(2), emit);

        // ── t = 1 .. T-1 ──
        for t in 1..time {
            let stay  = alpha.clone();
            let step  = shift_right(alpha.clone(), 1);
            let jump  = shift_right(alpha.clone(), 2);

            let merged = log_add(stay, step);
            let merged = merged.clone().mask_where(skip_ok.clone(), log_add(merged, jump));
            let next   = (merged + emissions(log_probs.clone(), t, &extended)).clamp_min(LOG_ZERO);

            let frame_live = input_lengths
                .clone()
                .greater_elem(t as i64)
                .reshape([batch, 1])
                .expand([batch, width]);
            alpha = alpha.mask_where(frame_live.bool_and(state_in_range.clone()), next);
        }

        // ── End in the final blank or the final label ──
        let last_blank = target_lengths.clone().mul_scalar(2).reshape([batch, 1]);
        let last_label = last_blank.clone().sub_scalar(1).clamp_min(0);

        let end_blank = alpha.clone().gather(1, last_blank).reshape([batch]);
        let end_label = alpha
            .gather(1, last_label)
            .reshape([batch])
            .mask_fill(target_lengths.equal_elem(0), LOG_ZERO);

        let log_likelihood = log_add(end_blank, end_label);
        let impossible     = log_likelihood.clone().lower_elem(LOG_ZERO / 2.0);
        log_likelihood.neg().mask_fill(impossible, f32::INFINITY)
    }
}

/// [fill, v1, fill, v2, ..., vU, fill] per row
fn interleave<B: Backend>(values: Tensor<B, 2, Int>, fill: i64) -> Tensor<B, 2, Int> {
    let [rows, cols] = values.dims();
    let device = values.device();
    let tail   = Tensor::<B, 2, Int>::full([rows, 1], fill, &device);
    if cols == 0 {
        return tail;
    }
    let gaps  = Tensor::<B, 2, Int>::full([rows, cols], fill, &device);
    let pairs = Tensor::stack::<3>(vec![gaps, values], 2).reshape([rows, 2 * cols]);
    Tensor::cat(vec![pairs, tail], 1)
}

/// True at label states that may be entered from two states back:
/// the label differs from the previous one. Blank states never.
fn skip_allowed<B: Backend>(targets: Tensor<B, 2, Int>) -> Tensor<B, 2, Bool> {
    let [rows, cols] = targets.dims();
    let device = targets.device();
    if cols == 0 {
        return Tensor::<B, 2, Int>::zeros([rows, 1], &device).equal_elem(1);
    }

    let first = Tensor::<B, 2, Int>::zeros([rows, 1], &device);
    let flags = if cols > 1 {
        let differs = targets
            .clone()
            .slice([0..rows, 1..cols])
            .not_equal(targets.slice([0..rows, 0..cols - 1]))
            .int();
        Tensor::cat(vec![first, differs], 1)
    } else {
        first
    };
    interleave(flags, 0).equal_elem(1)
}

/// y_t(l'(s)) for every row and state
fn emissions<B: Backend>(log_probs: Tensor<B, 3>, t: usize, extended: &Tensor<B, 2, Int>) -> Tensor<B, 2> {
    let [_, batch, classes] = log_probs.dims();
    log_probs
        .slice([t..t + 1, 0..batch, 0..classes])
        .reshape([batch, classes])
        .gather(1, extended.clone())
}

/// alpha(s - by), log 0 shifted in from the left
fn shift_right<B: Backend>(alpha: Tensor<B, 2>, by: usize) -> Tensor<B, 2> {
    let [rows, cols] = alpha.dims();
    let device = alpha.device();
    if by >= cols {
        return Tensor::full([rows, cols], LOG_ZERO, &device);
    }
    let fill = Tensor::full([rows, by], LOG_ZERO, &device);
    Tensor::cat(vec![fill, alpha.slice([0..rows, 0..cols - by])], 1)
}

/// log(exp(a) + exp(b)) = max(a, b) + log1p(exp(-|a - b|))
fn log_add<const D: usize, B: Backend>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, D> {
    let high = a.clone().max_pair(b.clone());
    high + (a - b).abs().neg().exp().log1p()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    type TestBackend = burn::backend::NdArray;
    type TestAutodiff = burn::backend::Autodiff<burn::backend::NdArray>;

    fn losses<B: Backend>(
        ctc:            &CtcLoss,
        log_probs:      Tensor<B, 3>,
        targets:        Vec<i64>,
        max_labels:     usize,
        input_lengths:  Vec<i64>,
        target_lengths: Vec<i64>,
    ) -> Vec<f32> {
        let device = log_probs.device();
        let batch  = input_lengths.len();
        ctc.forward(
            log_probs,
            Tensor::from_data(TensorData::new(targets, [batch, max_labels]), &device),
            Tensor::from_data(TensorData::new(input_lengths, [batch]), &device),
            Tensor::from_data(TensorData::new(target_lengths, [batch]), &device),
        )
        .into_data()
        .iter::<f32>()
        .collect()
    }

    fn uniform(time: usize, batch: usize, classes: usize) -> Tensor<TestBackend, 3> {
        Tensor::full([time, batch, classes], (1.0 / classes as f32).ln(), &Default::default())
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_interleave_inserts_blanks() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 2, Int>::from_data(TensorData::new(vec![1i64, 2, 3, 4], [2, 2]), &device);
        let v: Vec<i64> = interleave(t, 0).into_data().iter::<i64>().collect();
        assert_eq!(v, vec![0, 1, 0, 2, 0, 0, 3, 0, 4, 0]);
    }

    #[test]
    fn test_repeated_label_needs_a_blank_between() {
        // T=3, target [1,1]: only path is 1,b,1 → (1/2)^3
        let ctc  = CtcLossConfig::new().init();
        let loss = losses(&ctc, uniform(3, 1, 2), vec![1, 1], 2, vec![3], vec![2]);
        assert!(close(loss[0], 3.0 * 2.0f32.ln()), "loss = {}", loss[0]);
    }

    #[test]
    fn test_blank_at_the_end_of_the_alphabet() {
        // T=3, C=3, blank=2, target [0,1]: 5 valid paths out of 27
        let ctc  = CtcLossConfig::new().with_blank(2).init();
        let loss = losses(&ctc, uniform(3, 1, 3), vec![0, 1], 2, vec![3], vec![2]);
        assert!(close(loss[0], -(5.0f32 / 27.0).ln()), "loss = {}", loss[0]);
    }

    #[test]
    fn test_single_label_two_frames() {
        // paths 1b, b1, 11 → 3/4
        let ctc  = CtcLossConfig::new().init();
        let loss = losses(&ctc, uniform(2, 1, 2), vec![1], 1, vec![2], vec![1]);
        assert!(close(loss[0], -(0.75f32).ln()), "loss = {}", loss[0]);
    }

    #[test]
    fn test_more_labels_than_frames_is_infinite() {
        let ctc  = CtcLossConfig::new().init();
        let loss = losses(&ctc, uniform(2, 1, 3), vec![1, 1], 2, vec![2], vec![2]);
        assert!(loss[0].is_infinite() && loss[0] > 0.0, "loss = {}", loss[0]);
    }

    #[test]
    fn test_padding_does_not_change_a_row() {
        // Row 1 is padded in time (3 of 5 frames) and in labels
        // (1 of 2, pad = blank); it must score like the unpadded case.
        let ctc    = CtcLossConfig::new().init();
        let device = Default::default();
        let values: Vec<f32> = (0..5 * 2 * 3).map(|i| ((i * 7 % 11) as f32 * 0.37).sin()).collect();
        let log_probs = burn::tensor::activation::log_softmax(
            Tensor::<TestBackend, 3>::from_data(TensorData::new(values, [5, 2, 3]), &device),
            2,
        );

        let batched = losses(&ctc, log_probs.clone(), vec![1, 2, 2, 0], 2, vec![5, 3], vec![2, 1]);

        let row1  = log_probs.slice([0..3, 1..2, 0..3]);
        let alone = losses(&ctc, row1, vec![2], 1, vec![3], vec![1]);
        assert!(close(batched[1], alone[0]), "{} vs {}", batched[1], alone[0]);
        assert!(batched[0].is_finite());
    }

    #[test]
    fn test_gradient_is_finite() {
        let ctc    = CtcLossConfig::new().init();
        let device = Default::default();
        let logits = Tensor::<TestAutodiff, 3>::ones([4, 2, 3], &device).require_grad();
        let log_probs = burn::tensor::activation::log_softmax(logits.clone(), 2);

        let loss = ctc
            .forward(
                log_probs,
                Tensor::from_data(TensorData::new(vec![1i64, 2, 1, 0], [2, 2]), &device),
                Tensor::from_data(TensorData::new(vec![4i64, 3], [2]), &device),
                Tensor::from_data(TensorData::new(vec![2i64, 1], [2]), &device),
            )
            .sum();
        let grads = loss.backward();
        let grad: Vec<f32> = logits.grad(&grads).unwrap().into_data().iter::<f32>().collect();
        assert!(grad.iter().all(|g| g.is_finite()));
        assert!(grad.iter().any(|g| *g != 0.0));
    }
}
