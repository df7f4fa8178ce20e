// ============================================================
// Layer 5 — Optimizer Step (sync → clip → update)
// ============================================================
// One call per training iteration, after the loss gate:
//
//   Local:
//     gate passed  → clip → optimizer.step
//     gate failed  → nothing (update skipped)
//
//   Synchronized (W replicas):
//     flatten grads → [ok, g₀, g₁, ...]    (zeros + ok = 0 when the
//                                          local loss was rejected)
//     all_reduce_sum over the collective
//     n_ok = Σ ok
//       n_ok = 0 → every replica skips the update
//       n_ok > 0 → grads = Σ g / n_ok → clip → optimizer.step
//
// Every replica sees the same reduced vector, so all of them take
// the same decision and apply the same update, including a replica
// whose own loss was rejected. Parameters therefore stay identical
// across replicas.
//
// Gradients are visited in the module's parameter order, so the
// flattened layout matches on every replica.
//
// Global-norm clipping: ‖g‖ = sqrt(Σ g²) over all parameters;
// when ‖g‖ > max_norm every gradient is scaled by
// max_norm / (‖g‖ + 1e-6).

use std::{marker::PhantomData, sync::Arc};

use burn::{
    module::{AutodiffModule, ModuleVisitor, Param},
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, TensorData},
};

use crate::infra::distributed::{Collective, SyncError};

// ─── Gradient visitors ────────────────────────────────────────────────────────
/// Appends every float parameter's gradient (or zeros when there is
/// none) to one flat vector.
struct FlattenGrads<'a, B: AutodiffBackend> {
    grads:  Option<&'a GradientsParams>,
    values: Vec<f32>,
    _b:     PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for FlattenGrads<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let grad = self.grads.and_then(|g| g.get::<B::InnerBackend, D>(param.id));
        match grad {
            Some(grad) => self.values.extend(grad.into_data().iter::<f32>()),
            None => {
                let numel: usize = param.val().dims().iter().product();
                self.values.extend(std::iter::repeat(0.0).take(numel));
            }
        }
    }
}

/// Rebuilds a gradient for every float parameter from a flat vector
/// laid out by FlattenGrads, multiplied by `scale`. Stops at the first
/// parameter the vector is too short for and sets `short`.
struct ScatterGrads<'a, B: AutodiffBackend> {
    grads:  GradientsParams,
    values: &'a [f32],
    scale:  f32,
    offset: usize,
    short:  bool,
    _b:     PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScatterGrads<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let value = param.val();
        let dims  = value.dims();
        let numel: usize = dims.iter().product();

        if self.short {
            return;
        }
        let Some(slice) = self.values.get(self.offset..self.offset + numel) else {
            self.short = true;
            return;
        };
        let chunk: Vec<f32> = slice.iter().map(|v| v * self.scale).collect();
        self.offset += numel;

        let grad = Tensor::<B::InnerBackend, D>::from_data(
            TensorData::new(chunk, dims),
            &value.inner().device(),
        );
        self.grads.register::<B::InnerBackend, D>(param.id, grad);
    }
}

/// Σ g² over every gradient
struct SquaredNorm<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    total: f64,
    _b:    PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) {
            self.total += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

/// g ← g · factor, in place in the GradientsParams
struct ScaleGrads<'a, B: AutodiffBackend> {
    grads:  &'a mut GradientsParams,
    factor: f64,
    _b:     PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleGrads<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) {
            self.grads.register::<B::InnerBackend, D>(param.id, grad.mul_scalar(self.factor));
        }
    }
}

// ─── Public helpers ───────────────────────────────────────────────────────────
/// Flatten `grads` in `model`'s parameter order. Missing gradients
/// (or `None`) become zeros.
pub fn flatten_grads<B, M>(model: &M, grads: Option<&GradientsParams>) -> Vec<f32>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = FlattenGrads::<B> { grads, values: Vec::new(), _b: PhantomData };
    model.visit(&mut visitor);
    visitor.values
}

/// Inverse of flatten_grads, scaling every value by `scale`.
/// None when `values` is not exactly as long as the model's
/// flattened gradients.
pub fn scatter_grads<B, M>(model: &M, values: &[f32], scale: f32) -> Option<GradientsParams>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = ScatterGrads::<B> {
        grads: GradientsParams::new(),
        values,
        scale,
        offset: 0,
        short: false,
        _b: PhantomData,
    };
    model.visit(&mut visitor);
    (!visitor.short && visitor.offset == values.len()).then_some(visitor.grads)
}

/// Scale `grads` so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_global_norm<B, M>(model: &M, grads: &mut GradientsParams, max_norm: f64) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut norm = SquaredNorm::<B> { grads, total: 0.0, _b: PhantomData };
    model.visit(&mut norm);
    let total = norm.total.sqrt();

    if total > max_norm {
        let mut scale = ScaleGrads::<B> { grads, factor: max_norm / (total + 1e-6), _b: PhantomData };
        model.visit(&mut scale);
    }
    total
}

// ─── OptimizerStep ────────────────────────────────────────────────────────────
pub enum StepMode {
    Local,
    Synchronized {
        rank:       usize,
        collective: Arc<dyn Collective>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Skipped,
}

/// Wraps a Burn optimizer with gradient sync and clipping.
pub struct OptimizerStep<O> {
    optim:         O,
    mode:          StepMode,
    max_grad_norm: f64,
}

impl<O> OptimizerStep<O> {
    pub fn local(optim: O, max_grad_norm: f64) -> Self {
        Self { optim, mode: StepMode::Local, max_grad_norm }
    }

    pub fn synchronized(
        optim:         O,
        max_grad_norm: f64,
        rank:          usize,
        collective:    Arc<dyn Collective>,
    ) -> Self {
        Self { optim, mode: StepMode::Synchronized { rank, collective }, max_grad_norm }
    }

    pub fn optimizer(&self) -> &O {
        &self.optim
    }

    /// Apply one update. `grads` is None when the loss gate rejected
    /// this iteration's loss.
    pub fn apply<B, M>(
        &mut self,
        lr:    f64,
        model: M,
        grads: Option<GradientsParams>,
    ) -> Result<(M, StepOutcome), SyncError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let grads = match &self.mode {
            StepMode::Local => grads,
            StepMode::Synchronized { rank, collective } => {
                synchronize::<B, M>(&model, grads, *rank, collective.as_ref())?
            }
        };

        let Some(mut grads) = grads else {
            return Ok((model, StepOutcome::Skipped));
        };

        let norm = clip_global_norm::<B, M>(&model, &mut grads, self.max_grad_norm);
        if norm > self.max_grad_norm {
            tracing::debug!("Clipped gradient norm {:.2} to {:.2}", norm, self.max_grad_norm);
        }

        Ok((self.optim.step(lr, model, grads), StepOutcome::Applied))
    }
}

/// Average the gradients of the replicas whose loss passed the gate.
/// None when no replica has a gradient this step.
fn synchronize<B, M>(
    model:      &M,
    grads:      Option<GradientsParams>,
    rank:       usize,
    collective: &dyn Collective,
) -> Result<Option<GradientsParams>, SyncError>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let ok = if grads.is_some() { 1.0 } else { 0.0 };

    let mut message = vec![ok];
    message.extend(flatten_grads::<B, M>(model, grads.as_ref()));

    let expected = message.len();
    let reduced  = collective.all_reduce_sum(rank, message)?;
    let mismatch = SyncError::LengthMismatch { rank, expected, got: reduced.len() };
    let Some((&ok_sum, flat)) = reduced.split_first() else {
        return Err(mismatch);
    };
    if reduced.len() != expected {
        return Err(mismatch);
    }

    let n_ok = ok_sum.round();
    if n_ok < 1.0 {
        return Ok(None);
    }

    scatter_grads::<B, M>(model, flat, 1.0 / n_ok).map(Some).ok_or(mismatch)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use burn::{
        module::Module,
        nn::{Linear, LinearConfig},
        optim::SgdConfig,
    };

    use super::*;
    use crate::infra::distributed::launch;
    use crate::ml::record::{model_from_bytes, model_to_bytes};

    type TestBackend = burn::backend::Autodiff<burn::backend::NdArray>;

    #[derive(Module, Debug)]
    struct Tiny<B: Backend> {
        layer: Linear<B>,
    }

    fn tiny(device: &<TestBackend as Backend>::Device) -> Tiny<TestBackend> {
        Tiny { layer: LinearConfig::new(3, 2).init(device) }
    }

    fn loss_grads(model: &Tiny<TestBackend>, scale: f32) -> GradientsParams {
        let device = Default::default();
        let x      = Tensor::<TestBackend, 2>::ones([4, 3], &device).mul_scalar(scale);
        let loss   = model.layer.forward(x).powf_scalar(2.0).mean();
        GradientsParams::from_grads(loss.backward(), model)
    }

    fn weights(model: &Tiny<TestBackend>) -> Vec<f32> {
        model.layer.weight.val().into_data().iter::<f32>().collect()
    }

    fn to_bytes(model: &Tiny<TestBackend>) -> Vec<u8> {
        model_to_bytes::<TestBackend, _>(model).unwrap()
    }

    #[test]
    fn test_flatten_scatter_roundtrip_preserves_layout() {
        let device = Default::default();
        let model  = tiny(&device);
        let grads  = loss_grads(&model, 1.0);

        let flat     = flatten_grads::<TestBackend, _>(&model, Some(&grads));
        let restored = scatter_grads::<TestBackend, _>(&model, &flat, 1.0).unwrap();
        assert_eq!(flatten_grads::<TestBackend, _>(&model, Some(&restored)), flat);
        // weight 3x2 + bias 2
        assert_eq!(flat.len(), 8);
    }

    #[test]
    fn test_scatter_rejects_wrong_length() {
        let device = Default::default();
        let model  = tiny(&device);
        assert!(scatter_grads::<TestBackend, _>(&model, &[1.0; 7], 1.0).is_none());
        assert!(scatter_grads::<TestBackend, _>(&model, &[1.0; 9], 1.0).is_none());
        assert!(scatter_grads::<TestBackend, _>(&model, &[], 1.0).is_none());
    }

    #[test]
    fn test_missing_grads_flatten_to_zeros() {
        let device = Default::default();
        let model  = tiny(&device);
        let flat   = flatten_grads::<TestBackend, _>(&model, None);
        assert_eq!(flat, vec![0.0; 8]);
    }

    #[test]
    fn test_clip_global_norm() {
        let device    = Default::default();
        let model     = tiny(&device);
        let mut grads = loss_grads(&model, 10.0);

        let before = clip_global_norm::<TestBackend, _>(&model, &mut grads, 0.5);
        assert!(before > 0.5);

        let flat  = flatten_grads::<TestBackend, _>(&model, Some(&grads));
        let after = flat.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
        assert!((after - 0.5).abs() < 1e-3, "norm after clipping = {after}");
    }

    #[test]
    fn test_clip_leaves_small_gradients_alone() {
        let device    = Default::default();
        let model     = tiny(&device);
        let mut grads = loss_grads(&model, 0.01);
        let original  = flatten_grads::<TestBackend, _>(&model, Some(&grads));

        clip_global_norm::<TestBackend, _>(&model, &mut grads, 400.0);
        assert_eq!(flatten_grads::<TestBackend, _>(&model, Some(&grads)), original);
    }

    #[test]
    fn test_local_step_skips_without_grads() {
        let device   = Default::default();
        let model    = tiny(&device);
        let before   = weights(&model);
        let mut step = OptimizerStep::local(SgdConfig::new().init::<TestBackend, Tiny<TestBackend>>(), 400.0);

        let (model, outcome) = step.apply::<TestBackend, _>(0.1, model, None).unwrap();
        assert_eq!(outcome, StepOutcome::Skipped);
        assert_eq!(weights(&model), before);

        let grads = loss_grads(&model, 1.0);
        let (model, outcome) = step.apply::<TestBackend, _>(0.1, model, Some(grads)).unwrap();
        assert_eq!(outcome, StepOutcome::Applied);
        assert_ne!(weights(&model), before);
    }

    #[test]
    fn test_replicas_stay_identical_after_synchronized_steps() {
        let device   = Default::default();
        let template = to_bytes(&tiny(&device));

        let replicas = launch(3, Duration::from_secs(30), |ctx| {
            let device    = Default::default();
            let mut model = model_from_bytes::<TestBackend, _>(tiny(&device), template.clone(), &device)?;

            let collective = ctx.collective.clone().expect("collective");
            let mut step   = OptimizerStep::synchronized(SgdConfig::new().init::<TestBackend, Tiny<TestBackend>>(), 1.0, ctx.rank, collective);

            for iteration in 0..3 {
                // Every replica sees different data; rank 2 "rejects"
                // its loss on the second iteration.
                let grads = if ctx.rank == 2 && iteration == 1 {
                    None
                } else {
                    Some(loss_grads(&model, (ctx.rank + iteration + 1) as f32))
                };
                let (next, outcome) = step.apply::<TestBackend, _>(0.05, model, grads)?;
                assert_eq!(outcome, StepOutcome::Applied);
                model = next;
            }
            Ok(to_bytes(&model))
        })
        .unwrap();

        assert_ne!(replicas[0], template);
        assert!(replicas.iter().all(|r| *r == replicas[0]));
    }

    #[test]
    fn test_all_rejected_skips_everywhere() {
        let outcomes = launch(2, Duration::from_secs(30), |ctx| {
            let device     = Default::default();
            let model      = tiny(&device);
            let collective = ctx.collective.clone().expect("collective");
            let mut step   = OptimizerStep::synchronized(SgdConfig::new().init::<TestBackend, Tiny<TestBackend>>(), 400.0, ctx.rank, collective);
            let (_, outcome) = step.apply::<TestBackend, _>(0.1, model, None)?;
            Ok(outcome)
        })
        .unwrap();
        assert_eq!(outcomes, vec![StepOutcome::Skipped, StepOutcome::Skipped]);
    }

    /// Answers every reduction with a vector of a fixed length.
    struct WrongLength(usize);

    impl Collective for WrongLength {
        fn all_reduce_sum(&self, _rank: usize, _values: Vec<f32>) -> Result<Vec<f32>, SyncError> {
            Ok(vec![1.0; self.0])
        }

        fn abort(&self, _rank: usize, _reason: &str) {}
    }

    #[test]
    fn test_wrong_length_reduction_is_an_error() {
        let device = Default::default();
        for len in [0, 5, 12] {
            let model    = tiny(&device);
            let grads    = loss_grads(&model, 1.0);
            let mut step = OptimizerStep::synchronized(
                SgdConfig::new().init::<TestBackend, Tiny<TestBackend>>(),
                400.0,
                0,
                Arc::new(WrongLength(len)),
            );
            let err = step.apply::<TestBackend, _>(0.1, model, Some(grads)).err();
            assert_eq!(err, Some(SyncError::LengthMismatch { rank: 0, expected: 9, got: len }));
        }
    }
}
