// ============================================================
// Layer 5 — Parameter and Optimizer Blobs
// ============================================================
// In-memory serialisation of module and optimizer records with
// Burn's NamedMpkBytesRecorder (full precision). A blob that does
// not decode, or does not match the module, is an Err, never a
// panic.
//
// Used for:
//   - the template parameter blob every replica starts from
//   - model_state / optimizer_state inside a checkpoint
//
// Blobs are backend-agnostic: a model trained on Autodiff<Wgpu>
// loads into a plain Wgpu (or NdArray) model of the same config.

use anyhow::{anyhow, Result};
use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};

type BlobRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

pub fn model_to_bytes<B: Backend, M: Module<B>>(model: &M) -> Result<Vec<u8>> {
    Recorder::<B>::record(&BlobRecorder::default(), model.clone().into_record(), ())
        .map_err(|e| anyhow!("Cannot serialise model parameters: {e:?}"))
}

/// Load a parameter blob into `model`. Fails when the blob was
/// produced by a model with a different architecture.
pub fn model_from_bytes<B: Backend, M: Module<B>>(
    model:  M,
    bytes:  Vec<u8>,
    device: &B::Device,
) -> Result<M> {
    let record = Recorder::<B>::load(&BlobRecorder::default(), bytes, device)
        .map_err(|e| anyhow!("Cannot load model parameters: {e:?}"))?;
    Ok(model.load_record(record))
}

pub fn optimizer_to_bytes<B, M, O>(optim: &O) -> Result<Vec<u8>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    Recorder::<B>::record(&BlobRecorder::default(), optim.to_record(), ())
        .map_err(|e| anyhow!("Cannot serialise optimizer state: {e:?}"))
}

pub fn optimizer_from_bytes<B, M, O>(optim: O, bytes: Vec<u8>, device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let record = Recorder::<B>::load(&BlobRecorder::default(), bytes, device)
        .map_err(|e| anyhow!("Cannot load optimizer state: {e:?}"))?;
    Ok(optim.load_record(record))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::{DeepSpeech, DeepSpeechConfig};

    type TestBackend  = burn::backend::Autodiff<burn::backend::NdArray>;
    type InnerBackend = burn::backend::NdArray;

    fn config() -> DeepSpeechConfig {
        DeepSpeechConfig::new(3, 4).with_n_hidden(4)
    }

    #[test]
    fn test_blob_restores_identical_parameters() {
        let device = Default::default();
        let a: DeepSpeech<TestBackend> = config().init(&device);
        let b: DeepSpeech<TestBackend> = config().init(&device);

        let blob = model_to_bytes::<TestBackend, _>(&a).unwrap();
        let b    = model_from_bytes::<TestBackend, _>(b, blob.clone(), &device).unwrap();
        assert_eq!(model_to_bytes::<TestBackend, _>(&b).unwrap(), blob);
    }

    #[test]
    fn test_autodiff_blob_loads_into_inner_backend() {
        let device = Default::default();
        let a: DeepSpeech<TestBackend> = config().init(&device);
        let blob = model_to_bytes::<TestBackend, _>(&a).unwrap();

        let inner: DeepSpeech<InnerBackend> = config().init(&device);
        let inner = model_from_bytes::<InnerBackend, _>(inner, blob, &device).unwrap();

        let x  = Tensor::<InnerBackend, 4>::ones([1, 1, 2, 3], &device);
        let ya: Vec<f32> = a.valid().forward(x.clone()).into_data().iter::<f32>().collect();
        let yb: Vec<f32> = inner.forward(x).into_data().iter::<f32>().collect();
        assert_eq!(ya, yb);
    }

    #[test]
    fn test_garbage_blob_is_an_error() {
        let device = Default::default();
        let model: DeepSpeech<InnerBackend> = config().init(&device);
        assert!(model_from_bytes::<InnerBackend, _>(model, vec![1, 2, 3], &device).is_err());
    }

    #[test]
    fn test_truncated_blob_is_an_error() {
        let device = Default::default();
        let a: DeepSpeech<InnerBackend> = config().init(&device);
        let mut blob = model_to_bytes::<InnerBackend, _>(&a).unwrap();
        blob.truncate(blob.len() / 2);

        let b: DeepSpeech<InnerBackend> = config().init(&device);
        assert!(model_from_bytes::<InnerBackend, _>(b, blob, &device).is_err());
    }

    #[test]
    fn test_corrupt_optimizer_blob_is_an_error() {
        use burn::optim::AdamConfig;

        let device = Default::default();
        let optim  = AdamConfig::new().init::<TestBackend, DeepSpeech<TestBackend>>();
        let result = optimizer_from_bytes::<TestBackend, DeepSpeech<TestBackend>, _>(optim, vec![0xff; 7], &device);
        assert!(result.is_err());
    }
}
