//! Model artifact naming and the architecture-plus-weights export.

use crate::error::{TrainError, TrainResult};
use crate::pilot::Pilot;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Required extension of the primary model file.
pub const MODEL_EXTENSION: &str = "bin";

/// The primary checkpoint and its two sidecar files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub model: PathBuf,
    /// `<stem>.json`
    pub architecture: PathBuf,
    /// `<stem>.weights`
    pub weights: PathBuf,
}

impl ArtifactPaths {
    pub fn from_model_path(path: &Path) -> TrainResult<Self> {
        if !path.extension().is_some_and(|e| e == MODEL_EXTENSION) {
            return Err(TrainError::ArtifactSuffix {
                path: path.to_path_buf(),
                expected: MODEL_EXTENSION,
            });
        }
        Ok(Self {
            model: path.to_path_buf(),
            architecture: path.with_extension("json"),
            weights: path.with_extension("weights"),
        })
    }

    pub fn files(&self) -> [&Path; 3] {
        [&self.model, &self.architecture, &self.weights]
    }

    /// `<stem>_history.json` next to the model.
    pub fn history(&self) -> PathBuf {
        self.with_suffix("_history", "json")
    }

    /// `<stem>_prune_<channels>_filters.bin`.
    pub fn pruned(&self, channels: usize) -> PathBuf {
        self.with_suffix(&format!("_prune_{channels}_filters"), MODEL_EXTENSION)
    }

    fn with_suffix(&self, suffix: &str, ext: &str) -> PathBuf {
        let stem = self
            .model
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.model.with_file_name(format!("{stem}{suffix}.{ext}"))
    }
}

/// Pretty-printed JSON with sorted keys.
pub fn write_pretty_json<T: Serialize>(path: &Path, value: &T) -> TrainResult<()> {
    // Round-tripping through Value sorts object keys.
    let value = serde_json::to_value(value)?;
    let body = serde_json::to_string_pretty(&value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
    }
    fs::write(path, body).map_err(|e| TrainError::io(path, e))
}

/// Writes the architecture JSON and the raw weights next to the model file.
pub fn save_json_and_weights(model: &dyn Pilot, paths: &ArtifactPaths) -> TrainResult<()> {
    write_pretty_json(&paths.architecture, &model.architecture())?;
    model.save_weights(&paths.weights)
}
