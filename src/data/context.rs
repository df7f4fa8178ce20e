// ============================================================
// Layer 4 — Context Window Stacking
// ============================================================
// DeepSpeech does not look at a single MFCC frame at a time.
// Each input row is the current frame plus `n_context` frames on
// either side, concatenated:
//
//   row t = [ f(t - C) ... f(t - 1) | f(t) | f(t + 1) ... f(t + C) ]
//
// giving n_mfcc * (2C + 1) values per time step. Frames that fall
// before the start or after the end are zeros.
//
// The number of time steps does not change, so label/time
// alignment assumed by the CTC loss is unaffected.

/// Width of a stacked row
pub fn stacked_dim(n_features: usize, n_context: usize) -> usize {
    n_features * (2 * n_context + 1)
}

/// Stack a row-major [frames, n_features] matrix into
/// [frames, n_features * (2 * n_context + 1)].
pub fn stack_context(features: &[f32], n_features: usize, n_context: usize) -> Vec<f32> {
    if n_context == 0 || n_features == 0 {
        return features.to_vec();
    }

    let frames = features.len() / n_features;
    let width  = stacked_dim(n_features, n_context);
    let mut out = vec![0.0f32; frames * width];

    for t in 0..frames {
        let row = &mut out[t * width..(t + 1) * width];
        for (slot, offset) in (-(n_context as isize)..=n_context as isize).enumerate() {
            let src = t as isize + offset;
            if src < 0 || src >= frames as isize {
                continue; // stays zero
            }
            let src = src as usize;
            row[slot * n_features..(slot + 1) * n_features]
                .copy_from_slice(&features[src * n_features..(src + 1) * n_features]);
        }
    }

    out
}
