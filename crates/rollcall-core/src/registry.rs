//! Filesystem-backed store of trained classifier artifacts, one per identity.
//!
//! Layout: `<dir>/trained_model_<identity>.bin`. Writes go to a uniquely named
//! temp file in the same directory and are renamed into place, so a reader
//! sees either the previous artifact or the new one, never a partial file.
//! Saves and loads for the same identity are additionally serialized by an
//! in-process per-identity lock.

use crate::types::ModelArtifact;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const ARTIFACT_PREFIX: &str = "trained_model_";
const ARTIFACT_EXT: &str = "bin";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid identity key {0:?}: use ASCII letters, digits, '-', '_' or '.'")]
    InvalidIdentity(String),
    #[error("no trained model for identity {identity}")]
    NotFound { identity: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    fn io(path: &Path, source: io::Error) -> Self {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Identity → artifact store rooted at a single directory.
#[derive(Debug)]
pub struct ModelRegistry {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelRegistry {
    /// Open (and create if absent) the artifact directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| RegistryError::io(&dir, e))?;
        tracing::debug!(dir = %dir.display(), "model registry opened");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical on-disk location of an identity's artifact.
    pub fn artifact_path(&self, identity: &str) -> Result<PathBuf, RegistryError> {
        validate_identity(identity)?;
        Ok(self
            .dir
            .join(format!("{ARTIFACT_PREFIX}{identity}.{ARTIFACT_EXT}")))
    }

    /// Whether an artifact has been saved for `identity`. Invalid keys never exist.
    pub fn exists(&self, identity: &str) -> bool {
        self.artifact_path(identity)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Atomically replace the artifact for `identity`.
    ///
    /// On error the previous artifact, if any, is left untouched.
    pub fn save(&self, identity: &str, artifact: &ModelArtifact) -> Result<(), RegistryError> {
        let path = self.artifact_path(identity)?;
        let slot = self.slot(identity);
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let tmp_path = self.dir.join(format!(
            ".{ARTIFACT_PREFIX}{identity}.{}.tmp",
            uuid::Uuid::new_v4().simple()
        ));

        if let Err(e) = write_synced(&tmp_path, artifact.as_bytes()) {
            discard_temp(&tmp_path);
            return Err(RegistryError::io(&tmp_path, e));
        }
        if let Err(e) = fs::rename(&tmp_path, &path) {
            discard_temp(&tmp_path);
            return Err(RegistryError::io(&path, e));
        }
        sync_dir(&self.dir);

        tracing::info!(
            identity,
            path = %path.display(),
            bytes = artifact.len(),
            "artifact saved"
        );
        Ok(())
    }

    /// Read the artifact for `identity`.
    pub fn load(&self, identity: &str) -> Result<ModelArtifact, RegistryError> {
        let path = self.artifact_path(identity)?;
        let slot = self.slot(identity);
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);

        match fs::read(&path) {
            Ok(bytes) => {
                tracing::debug!(identity, path = %path.display(), bytes = bytes.len(), "artifact loaded");
                Ok(ModelArtifact::from_bytes(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RegistryError::NotFound {
                identity: identity.to_string(),
            }),
            Err(e) => Err(RegistryError::io(&path, e)),
        }
    }

    /// Identity keys with a saved artifact, sorted.
    pub fn identities(&self) -> Result<Vec<String>, RegistryError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| RegistryError::io(&self.dir, e))?;
        let suffix = format!(".{ARTIFACT_EXT}");

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RegistryError::io(&self.dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let id = name
                .strip_prefix(ARTIFACT_PREFIX)
                .and_then(|rest| rest.strip_suffix(suffix.as_str()));
            if let Some(id) = id {
                if validate_identity(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// The lock guarding one identity's artifact slot.
    fn slot(&self, identity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(identity.to_string()).or_default().clone()
    }
}

/// Identity keys become part of a file name, so keep them to a safe alphabet.
pub fn validate_identity(identity: &str) -> Result<(), RegistryError> {
    let valid = !identity.is_empty()
        && !identity.starts_with('.')
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidIdentity(identity.to_string()))
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn discard_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove temp artifact");
        }
    }
}

/// Persist the rename itself. Best effort.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
