//! Verification: does a probe image match the claimed identity's classifier?

use crate::codec::{self, DecodeError};
use crate::model::{self, InferenceBackend, ModelError};
use crate::preprocess::{PreprocessError, Preprocessor};
use crate::registry::{ModelRegistry, RegistryError};
use crate::types::{MatchDecision, NoMatchReason, RawImage};
use burn::tensor::backend::Backend;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("probe image could not be decoded: {0}")]
    Decode(#[from] DecodeError),
    #[error("probe image could not be preprocessed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("inference failed: {0}")]
    Inference(#[from] ModelError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
}

/// Decision rule applied to the positive-class probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// A probe matches when its positive-class probability exceeds this.
    pub threshold: f32,
    /// Probabilities within this distance of `threshold` are reported as
    /// uncertain instead of matched or rejected. Zero disables the band.
    pub rejection_margin: f32,
}

impl Default for MatchPolicy {
    /// Equivalent to taking the arg-max of the two classes.
    fn default() -> Self {
        Self {
            threshold: 0.5,
            rejection_margin: 0.0,
        }
    }
}

impl MatchPolicy {
    pub fn decide(&self, identity: &str, confidence: f32) -> MatchDecision {
        if self.rejection_margin > 0.0 && (confidence - self.threshold).abs() < self.rejection_margin {
            MatchDecision::NoMatch {
                reason: NoMatchReason::Uncertain,
                confidence: Some(confidence),
            }
        } else if confidence > self.threshold {
            MatchDecision::Match {
                identity: identity.to_string(),
                confidence,
            }
        } else {
            MatchDecision::NoMatch {
                reason: NoMatchReason::Rejected,
                confidence: Some(confidence),
            }
        }
    }
}

/// Verifies probes against per-identity classifiers.
///
/// Artifacts are reloaded from the registry on every call; nothing is cached.
pub struct Recognizer {
    registry: Arc<ModelRegistry>,
    preprocessor: Preprocessor,
    policy: MatchPolicy,
}

impl Recognizer {
    pub fn new(registry: Arc<ModelRegistry>, preprocessor: Preprocessor, policy: MatchPolicy) -> Self {
        Self {
            registry,
            preprocessor,
            policy,
        }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Verify `probe` against `identity`.
    ///
    /// A missing artifact is a no-match, not an error. Errors are reserved for
    /// bad probes, unusable artifacts and registry I/O failures.
    pub fn recognize(
        &self,
        probe: &RawImage,
        identity: &str,
    ) -> Result<MatchDecision, RecognizerError> {
        if !self.registry.exists(identity) {
            tracing::error!(identity, "no trained model for identity; train it first");
            return Ok(artifact_missing());
        }

        let artifact = match self.registry.load(identity) {
            Ok(artifact) => artifact,
            Err(RegistryError::NotFound { .. }) => {
                // Removed between the existence check and the read.
                tracing::error!(identity, "trained model disappeared before it could be loaded");
                return Ok(artifact_missing());
            }
            Err(e) => return Err(e.into()),
        };

        let device = <InferenceBackend as Backend>::Device::default();
        let classifier = model::catch_backend_panic::<_, ModelError>(|| {
            model::from_artifact::<InferenceBackend>(&artifact, &device)
        })
        .map_err(|e| {
            tracing::error!(identity, operation = "recognize", error = %e, "artifact unusable");
            e
        })?;

        let decoded = codec::decode(probe)?;
        let canonical = self.preprocessor.normalize(&decoded)?;

        let confidence = model::catch_backend_panic::<_, ModelError>(|| {
            let probs = model::positive_probabilities(&classifier, &canonical, &device)?;
            probs.first().copied().ok_or(ModelError::OutputShape {
                expected: 1,
                actual: 0,
            })
        })
        .map_err(|e| {
            tracing::error!(identity, operation = "recognize", error = %e, "forward pass failed");
            e
        })?;

        let decision = self.policy.decide(identity, confidence);
        tracing::info!(
            identity,
            probe = %probe.describe(),
            confidence,
            matched = decision.is_match(),
            "recognition complete"
        );
        Ok(decision)
    }
}

fn artifact_missing() -> MatchDecision {
    MatchDecision::NoMatch {
        reason: NoMatchReason::ArtifactMissing,
        confidence: None,
    }
}
