//! Per-identity face classifier: a small CNN with a two-way softmax head.
//!
//! Class 0 is "not this identity", class 1 is "this identity". The network
//! consumes canonical `(N, 100, 100, 3)` BGR tensors; pixel scaling and the
//! NHWC → NCHW permute happen inside [`FaceClassifier::forward`].

use crate::types::{CanonicalImage, ModelArtifact, CANONICAL_CHANNELS, CANONICAL_SIZE};
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use thiserror::Error;

/// Backend used for inference and artifact loading.
pub type InferenceBackend = burn::backend::NdArray<f32>;
/// Autodiff backend used while fitting.
pub type TrainBackend = burn::backend::Autodiff<InferenceBackend>;

// --- Architecture constants ---
const CONV_CHANNELS: [usize; 3] = [32, 64, 64];
const KERNEL: [usize; 2] = [3, 3];
const POOL: [usize; 2] = [2, 2];
const HIDDEN_UNITS: usize = 64;
/// "not this identity" / "this identity".
pub const NUM_CLASSES: usize = 2;
pub const POSITIVE_CLASS: usize = 1;
pub const NEGATIVE_CLASS: usize = 0;
const PIXEL_SCALE: f32 = 1.0 / 255.0;

/// Spatial side length after three valid 3×3 convolutions, each followed by
/// a 2×2/2 max-pool: 100 → 98 → 49 → 47 → 23 → 21 → 10.
const fn feature_side() -> usize {
    let mut side = CANONICAL_SIZE;
    let mut stage = 0;
    while stage < CONV_CHANNELS.len() {
        side = (side - (KERNEL[0] - 1)) / POOL[0];
        stage += 1;
    }
    side
}

const FLAT_FEATURES: usize = CONV_CHANNELS[2] * feature_side() * feature_side();

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("cannot serialize classifier: {0}")]
    Serialize(String),
    #[error("artifact is not a valid classifier: {0}")]
    Deserialize(String),
    #[error("expected {expected} output values, got {actual}")]
    OutputShape { expected: usize, actual: usize },
    #[error("cannot read tensor data: {0}")]
    TensorData(String),
    #[error("backend panicked: {0}")]
    Panicked(String),
}

/// Conv ×3 → dense → 2-way logits.
#[derive(Module, Debug)]
pub struct FaceClassifier<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    hidden: Linear<B>,
    output: Linear<B>,
}

/// Build an untrained classifier with freshly initialized weights.
pub fn build_classifier<B: Backend>(device: &B::Device) -> FaceClassifier<B> {
    let [c1, c2, c3] = CONV_CHANNELS;
    FaceClassifier {
        conv1: Conv2dConfig::new([CANONICAL_CHANNELS, c1], KERNEL).init(device),
        conv2: Conv2dConfig::new([c1, c2], KERNEL).init(device),
        conv3: Conv2dConfig::new([c2, c3], KERNEL).init(device),
        pool: MaxPool2dConfig::new(POOL).with_strides(POOL).init(),
        hidden: LinearConfig::new(FLAT_FEATURES, HIDDEN_UNITS).init(device),
        output: LinearConfig::new(HIDDEN_UNITS, NUM_CLASSES).init(device),
    }
}

impl<B: Backend> FaceClassifier<B> {
    /// Raw class logits, `[N, 2]`, for an NHWC pixel tensor in 0–255.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = images.permute([0, 3, 1, 2]).mul_scalar(PIXEL_SCALE);

        let x = self.pool.forward(relu(self.conv1.forward(x)));
        let x = self.pool.forward(relu(self.conv2.forward(x)));
        let x = self.pool.forward(relu(self.conv3.forward(x)));

        let [batch, _, _, _] = x.dims();
        let x = x.reshape([batch, FLAT_FEATURES]);
        let x = relu(self.hidden.forward(x));
        self.output.forward(x)
    }

    /// Class probabilities, `[N, 2]`.
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }
}

/// Move a canonical image batch onto `device` as an `f32` NHWC tensor.
pub fn to_tensor<B: Backend>(images: &CanonicalImage, device: &B::Device) -> Tensor<B, 4> {
    let data = TensorData::new(images.to_f32_vec(), images.shape());
    Tensor::from_data(data, device)
}

/// Positive-class probability for every image in the batch.
pub fn positive_probabilities<B: Backend>(
    model: &FaceClassifier<B>,
    images: &CanonicalImage,
    device: &B::Device,
) -> Result<Vec<f32>, ModelError> {
    let probs = model.probabilities(to_tensor(images, device));
    let values = probs
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| ModelError::TensorData(format!("{e:?}")))?;

    let expected = images.batch_len() * NUM_CLASSES;
    if values.len() != expected {
        return Err(ModelError::OutputShape {
            expected,
            actual: values.len(),
        });
    }

    Ok(values
        .chunks_exact(NUM_CLASSES)
        .map(|row| row[POSITIVE_CLASS])
        .collect())
}

/// Serialize a classifier's weights into an opaque artifact.
pub fn to_artifact<B: Backend>(model: FaceClassifier<B>) -> Result<ModelArtifact, ModelError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let bytes = Recorder::<B>::record(&recorder, model.into_record(), ())
        .map_err(|e| ModelError::Serialize(format!("{e:?}")))?;
    Ok(ModelArtifact::from_bytes(bytes))
}

/// Rebuild a classifier from an artifact produced by [`to_artifact`].
pub fn from_artifact<B: Backend>(
    artifact: &ModelArtifact,
    device: &B::Device,
) -> Result<FaceClassifier<B>, ModelError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = Recorder::<B>::load(&recorder, artifact.as_bytes().to_vec(), device)
        .map_err(|e| ModelError::Deserialize(format!("{e:?}")))?;
    Ok(build_classifier::<B>(device).load_record(record))
}

/// Run backend work, converting a panic (burn asserts on shape mismatches)
/// into [`ModelError::Panicked`], lifted into the caller's error type.
pub fn catch_backend_panic<T, E: From<ModelError>>(
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ModelError::Panicked(msg).into())
        }
    }
}
