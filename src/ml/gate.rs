// ============================================================
// Layer 5 — Loss Validity Gate
// ============================================================
// CTC loss is a negative log-likelihood, so it is never below
// zero. When the numbers break down (an utterance too short for
// its transcript, an overflow on a long batch) the loss comes
// back as ±inf, NaN or a negative value, and back-propagating it
// would wreck the weights.
//
// Checks, in order:
//   1. scalar is +inf or -inf            → NonFinite
//   2. NaN anywhere in the per-sample
//      losses (or in the scalar itself)  → Nan
//   3. scalar < 0                        → Negative
//   4. otherwise                         → Valid
//
// The per-sample vector is inspected because a reduction can
// hide a NaN element from the scalar.
//
// On Invalid the training loop skips backward + step, logs the
// cause, still counts the iteration and adds 0.0 to the running
// loss.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidLoss {
    NonFinite,
    Nan,
    Negative,
}

impl fmt::Display for InvalidLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NonFinite => "received an inf loss",
            Self::Nan       => "received a nan loss",
            Self::Negative  => "received a negative loss",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCheck {
    Valid,
    Invalid(InvalidLoss),
}

/// Classify a reduced loss value together with the raw
/// per-sample losses it was reduced from.
pub fn check_loss(value: f64, per_sample: &[f32]) -> LossCheck {
    if value.is_infinite() {
        LossCheck::Invalid(InvalidLoss::NonFinite)
    } else if value.is_nan() || per_sample.iter().any(|v| v.is_nan()) {
        LossCheck::Invalid(InvalidLoss::Nan)
    } else if value < 0.0 {
        LossCheck::Invalid(InvalidLoss::Negative)
    } else {
        LossCheck::Valid
    }
}
