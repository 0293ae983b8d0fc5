//! Enrollment: fit a fresh classifier for one identity and persist it.

use crate::codec::{self, DecodeError};
use crate::model::{
    build_classifier, catch_backend_panic, to_artifact, to_tensor, FaceClassifier,
    InferenceBackend, ModelError, TrainBackend, NEGATIVE_CLASS, POSITIVE_CLASS,
};
use crate::preprocess::{PreprocessError, Preprocessor};
use crate::registry::{validate_identity, ModelRegistry, RegistryError};
use crate::types::{CanonicalImage, ModelArtifact, RawImage};
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor, TensorData};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("no training images supplied")]
    NoExamples,
    #[error("image #{index} ({source_desc}): {source}")]
    Decode {
        index: usize,
        source_desc: String,
        #[source]
        source: DecodeError,
    },
    #[error("image #{index} ({source_desc}): {source}")]
    Preprocess {
        index: usize,
        source_desc: String,
        #[source]
        source: PreprocessError,
    },
    #[error("batching failed: {0}")]
    Batch(#[from] PreprocessError),
    #[error("loss became non-finite at epoch {epoch}")]
    Diverged { epoch: usize },
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("cannot read negative pool {path}: {source}")]
    NegativePoolIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("negative pool {0} contains no usable images")]
    EmptyNegativePool(PathBuf),
}

/// Hyperparameters for one `train` call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSettings {
    pub epochs: usize,
    pub learning_rate: f64,
    pub seed: Option<u64>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            epochs: 5,
            learning_rate: 1e-3,
            seed: None,
        }
    }
}

/// Summary of a successful training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Enrollment images for the identity (label 1).
    pub positives: usize,
    /// Impostor images from the negative pool (label 0).
    pub negatives: usize,
    pub epochs: usize,
    /// Loss and accuracy of the last epoch, measured before its update step.
    pub final_loss: f32,
    pub final_accuracy: f32,
}

/// Trains per-identity classifiers and hands them to the registry.
pub struct Trainer {
    registry: Arc<ModelRegistry>,
    preprocessor: Preprocessor,
    settings: TrainingSettings,
    negatives: Option<CanonicalImage>,
}

impl Trainer {
    pub fn new(
        registry: Arc<ModelRegistry>,
        preprocessor: Preprocessor,
        settings: TrainingSettings,
    ) -> Self {
        Self {
            registry,
            preprocessor,
            settings,
            negatives: None,
        }
    }

    /// Mix these label-0 examples into every training batch.
    pub fn with_negatives(mut self, negatives: CanonicalImage) -> Self {
        self.negatives = Some(negatives);
        self
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    /// Train and persist a classifier for `identity`.
    ///
    /// Never fails loudly: every error is logged and reported as `false`. The
    /// previously saved artifact, if any, survives a failed call unchanged.
    pub fn train(&self, identity: &str, images: &[RawImage]) -> bool {
        let started = Instant::now();
        match self.try_train(identity, images) {
            Ok(report) => {
                tracing::info!(
                    identity,
                    positives = report.positives,
                    negatives = report.negatives,
                    epochs = report.epochs,
                    loss = report.final_loss,
                    accuracy = report.final_accuracy,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "training complete"
                );
                true
            }
            Err(e) => {
                tracing::error!(identity, operation = "train", error = %e, "training failed");
                false
            }
        }
    }

    /// Like [`train`](Self::train), but surfaces the failure.
    pub fn try_train(
        &self,
        identity: &str,
        images: &[RawImage],
    ) -> Result<TrainingReport, TrainerError> {
        validate_identity(identity)?;
        tracing::debug!(identity, images = images.len(), "training requested");

        let positives = self.canonicalize(images)?;
        let positive_count = positives.batch_len();

        let (batch, labels, negative_count) = match &self.negatives {
            Some(neg) => {
                let batch = Preprocessor::stack(&[positives, neg.clone()])?;
                let mut labels = vec![POSITIVE_CLASS as i64; positive_count];
                labels.extend(std::iter::repeat(NEGATIVE_CLASS as i64).take(neg.batch_len()));
                (batch, labels, neg.batch_len())
            }
            None => (positives, vec![POSITIVE_CLASS as i64; positive_count], 0),
        };

        let (artifact, stats) = fit_artifact(&batch, &labels, &self.settings)?;
        self.registry.save(identity, &artifact)?;

        Ok(TrainingReport {
            positives: positive_count,
            negatives: negative_count,
            epochs: self.settings.epochs,
            final_loss: stats.final_loss,
            final_accuracy: stats.final_accuracy,
        })
    }

    /// Decode and preprocess every image. Any bad image fails the whole call.
    fn canonicalize(&self, images: &[RawImage]) -> Result<CanonicalImage, TrainerError> {
        if images.is_empty() {
            return Err(TrainerError::NoExamples);
        }
        let mut canonical = Vec::with_capacity(images.len());
        for (index, raw) in images.iter().enumerate() {
            let decoded = codec::decode(raw).map_err(|source| TrainerError::Decode {
                index,
                source_desc: raw.describe(),
                source,
            })?;
            let image =
                self.preprocessor
                    .normalize(&decoded)
                    .map_err(|source| TrainerError::Preprocess {
                        index,
                        source_desc: raw.describe(),
                        source,
                    })?;
            canonical.push(image);
        }
        Ok(Preprocessor::stack(&canonical)?)
    }
}

/// [`fit`] then serialize, with backend panics reported as
/// [`ModelError::Panicked`] instead of unwinding into the caller.
fn fit_artifact(
    batch: &CanonicalImage,
    labels: &[i64],
    settings: &TrainingSettings,
) -> Result<(ModelArtifact, FitStats), TrainerError> {
    catch_backend_panic(|| {
        let (model, stats) = fit(batch, labels, settings)?;
        Ok::<_, TrainerError>((to_artifact(model)?, stats))
    })
}

/// Loss and accuracy of the final epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FitStats {
    pub final_loss: f32,
    pub final_accuracy: f32,
}

/// Fit a freshly initialized classifier on one full batch for `settings.epochs` steps.
pub fn fit(
    batch: &CanonicalImage,
    labels: &[i64],
    settings: &TrainingSettings,
) -> Result<(FaceClassifier<InferenceBackend>, FitStats), TrainerError> {
    if batch.batch_len() == 0 || batch.batch_len() != labels.len() {
        return Err(TrainerError::NoExamples);
    }

    let device = <TrainBackend as Backend>::Device::default();
    if let Some(seed) = settings.seed {
        TrainBackend::seed(seed);
    }

    let mut model = build_classifier::<TrainBackend>(&device);
    let mut optim = AdamConfig::new().init();
    let loss_fn = CrossEntropyLossConfig::new().init(&device);

    let inputs = to_tensor::<TrainBackend>(batch, &device);
    let targets = Tensor::<TrainBackend, 1, Int>::from_data(
        TensorData::new(labels.to_vec(), [labels.len()]),
        &device,
    );

    let mut stats = FitStats::default();
    for epoch in 1..=settings.epochs {
        let logits = model.forward(inputs.clone());
        let loss = loss_fn.forward(logits.clone(), targets.clone());

        let loss_value = loss.clone().into_scalar().elem::<f32>();
        if !loss_value.is_finite() {
            return Err(TrainerError::Diverged { epoch });
        }
        let accuracy = accuracy(logits, targets.clone());

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optim.step(settings.learning_rate, model, grads);

        tracing::debug!(epoch, loss = loss_value, accuracy, "epoch complete");
        stats = FitStats {
            final_loss: loss_value,
            final_accuracy: accuracy,
        };
    }

    Ok((model.valid(), stats))
}

/// Fraction of rows whose arg-max class equals the target.
fn accuracy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> f32 {
    let [n] = targets.dims();
    let predicted = logits.argmax(1).squeeze::<1>(1);
    let correct = predicted
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<f32>();
    correct / n as f32
}

/// Load every decodable image in `dir` as a label-0 batch.
///
/// Unreadable entries are skipped with a warning; an empty result is an error.
pub fn load_negative_pool(
    dir: &Path,
    preprocessor: &Preprocessor,
) -> Result<CanonicalImage, TrainerError> {
    let io_err = |source: std::io::Error| TrainerError::NegativePoolIo {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.retain(|p| p.is_file());
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = RawImage::Path(path);
        let outcome = codec::decode(&raw)
            .map_err(|e| e.to_string())
            .and_then(|decoded| preprocessor.normalize(&decoded).map_err(|e| e.to_string()));
        match outcome {
            Ok(img) => images.push(img),
            Err(error) => tracing::warn!(path = %raw.describe(), %error, "skipping negative image"),
        }
    }

    if images.is_empty() {
        return Err(TrainerError::EmptyNegativePool(dir.to_path_buf()));
    }
    tracing::info!(dir = %dir.display(), count = images.len(), "negative pool loaded");
    Ok(Preprocessor::stack(&images)?)
}
