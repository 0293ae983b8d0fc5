use crate::recognizer::MatchPolicy;
use crate::trainer::TrainingSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Subsystem configuration.
///
/// Resolution order: built-in defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding one trained artifact per identity (created if missing).
    pub model_dir: PathBuf,
    /// Full-batch training epochs per `train` call.
    pub epochs: usize,
    /// Adam learning rate.
    pub learning_rate: f64,
    /// Seed for weight initialization. Unset means nondeterministic.
    pub seed: Option<u64>,
    /// Positive-class probability a probe must exceed to match.
    pub match_threshold: f32,
    /// Half-width of the "uncertain" band around `match_threshold`.
    pub rejection_margin: f32,
    /// Coerce grayscale input to three channels instead of rejecting it.
    pub allow_grayscale: bool,
    /// Optional directory of impostor images used as negative examples.
    pub negative_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            epochs: 5,
            learning_rate: 1e-3,
            seed: None,
            match_threshold: 0.5,
            rejection_margin: 0.0,
            allow_grayscale: true,
            negative_dir: None,
        }
    }
}

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("models")
}

impl Config {
    /// Defaults, overlaid with `path` (if given) and the environment, then validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        let config = base.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ROLLCALL_*` environment variables.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are
    /// ignored with a warning.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_NEGATIVE_DIR") {
            self.negative_dir = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        override_parsed(&lookup, "ROLLCALL_EPOCHS", &mut self.epochs);
        override_parsed(&lookup, "ROLLCALL_LEARNING_RATE", &mut self.learning_rate);
        override_parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "ROLLCALL_REJECTION_MARGIN", &mut self.rejection_margin);
        if let Some(v) = lookup("ROLLCALL_SEED") {
            match v.parse() {
                Ok(seed) => self.seed = Some(seed),
                Err(_) => tracing::warn!(key = "ROLLCALL_SEED", value = %v, "ignoring unparseable value"),
            }
        }
        if let Some(v) = lookup("ROLLCALL_ALLOW_GRAYSCALE") {
            self.allow_grayscale = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epochs == 0 {
            return Err(ConfigError::Invalid("epochs must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.match_threshold > 0.0 && self.match_threshold < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be in (0, 1), got {}",
                self.match_threshold
            )));
        }
        if !(self.rejection_margin >= 0.0 && self.rejection_margin < 0.5) {
            return Err(ConfigError::Invalid(format!(
                "rejection_margin must be in [0, 0.5), got {}",
                self.rejection_margin
            )));
        }
        Ok(())
    }

    pub fn training(&self) -> TrainingSettings {
        TrainingSettings {
            epochs: self.epochs,
            learning_rate: self.learning_rate,
            seed: self.seed,
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.match_threshold,
            rejection_margin: self.rejection_margin,
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = lookup(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparseable value"),
        }
    }
}
