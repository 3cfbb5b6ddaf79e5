use std::path::PathBuf;
use thiserror::Error;
use tub_dataset::TubDatasetError;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("model path {path} must end in .{expected}")]
    ArtifactSuffix { path: PathBuf, expected: &'static str },
    #[error("not enough training data: {samples} samples give {steps} steps at batch size {batch_size}, need at least 2")]
    InsufficientData {
        samples: usize,
        batch_size: usize,
        steps: usize,
    },
    #[error("{kind} models cannot train in continuous mode")]
    UnsupportedContinuous { kind: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("config parse error at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model must be compiled before fitting")]
    NotCompiled,
    #[error("pruning evaluation subset is empty")]
    EmptyEvaluation,
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("batch does not fit the model: {0}")]
    BatchShape(String),
    #[error(transparent)]
    Dataset(#[from] TubDatasetError),
}

impl TrainError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            path: path.into(),
            source,
        }
    }
}
