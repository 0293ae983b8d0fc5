//! rollcall-core — Per-identity face verification engine.
//!
//! Each enrolled identity gets its own small convolutional classifier, trained
//! in-process with burn on CPU and persisted as one artifact file. Verification
//! reloads that artifact and scores a probe image against it.

pub mod codec;
pub mod config;
pub mod jobs;
pub mod model;
pub mod preprocess;
pub mod recognizer;
pub mod registry;
pub mod trainer;
pub mod types;

pub use config::Config;
pub use jobs::{JobId, JobState, JobStatus, TrainingQueue};
pub use recognizer::{MatchPolicy, Recognizer, RecognizerError};
pub use registry::ModelRegistry;
pub use trainer::{Trainer, TrainingReport};
pub use types::{CanonicalImage, MatchDecision, NoMatchReason, RawImage};

use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("registry: {0}")]
    Registry(#[from] registry::RegistryError),
    #[error("negative pool: {0}")]
    NegativePool(#[from] trainer::TrainerError),
}

/// The two public operations, wired from one [`Config`].
///
/// Trainer and recognizer share one registry, so a successful `train` is
/// visible to the next `recognize` for that identity.
pub struct Verifier {
    registry: Arc<ModelRegistry>,
    trainer: Arc<Trainer>,
    recognizer: Recognizer,
}

impl Verifier {
    pub fn new(config: &Config) -> Result<Self, VerifierError> {
        config.validate()?;
        let registry = Arc::new(ModelRegistry::open(&config.model_dir)?);
        let preprocessor = preprocess::Preprocessor::new(config.allow_grayscale);

        let mut trainer = Trainer::new(
            Arc::clone(&registry),
            preprocessor.clone(),
            config.training(),
        );
        if let Some(dir) = &config.negative_dir {
            trainer = trainer.with_negatives(trainer::load_negative_pool(dir, &preprocessor)?);
        }
        let recognizer = Recognizer::new(Arc::clone(&registry), preprocessor, config.match_policy());

        tracing::info!(
            model_dir = %config.model_dir.display(),
            epochs = config.epochs,
            negatives = config.negative_dir.is_some(),
            "verifier ready"
        );
        Ok(Self {
            registry,
            trainer: Arc::new(trainer),
            recognizer,
        })
    }

    /// Enroll `identity` from `images`. `false` means nothing was saved.
    pub fn train(&self, identity: &str, images: &[RawImage]) -> bool {
        self.trainer.train(identity, images)
    }

    /// `Some(identity)` when `probe` matches the claimed identity.
    pub fn recognize(
        &self,
        probe: &RawImage,
        identity: &str,
    ) -> Result<Option<String>, RecognizerError> {
        Ok(self.recognizer.recognize(probe, identity)?.into_identity())
    }

    /// Full decision, including confidence and the no-match reason.
    pub fn verify(&self, probe: &RawImage, identity: &str) -> Result<MatchDecision, RecognizerError> {
        self.recognizer.recognize(probe, identity)
    }

    /// Start a background worker sharing this verifier's trainer.
    pub fn training_queue(&self, capacity: usize) -> Result<TrainingQueue, jobs::JobError> {
        TrainingQueue::spawn(Arc::clone(&self.trainer), capacity)
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn trainer(&self) -> &Arc<Trainer> {
        &self.trainer
    }

    pub fn recognizer(&self) -> &Recognizer {
        &self.recognizer
    }
}
