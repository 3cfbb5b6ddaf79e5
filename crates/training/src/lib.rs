#![recursion_limit = "256"]

pub mod artifacts;
pub mod burn_pilot;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod controller;
pub mod early_stopping;
pub mod error;
pub mod export;
pub mod kind;
pub mod pilot;
pub mod prune;

pub use artifacts::{save_json_and_weights, write_pretty_json, ArtifactPaths, MODEL_EXTENSION};
pub use burn_pilot::BurnPilot;
pub use checkpoint::CheckpointPolicy;
pub use config::{TrainConfig, CONFIG_ENV, DEFAULT_CONFIG_NAME};
pub use controller::{Phase, StopReason, TrainReport, TrainRequest, TrainingController};
pub use early_stopping::EarlyStopping;
pub use error::{TrainError, TrainResult};
pub use export::{BestModelHook, ExportHook, RemoteTarget};
pub use kind::{ModelKind, Regime};
pub use pilot::{EpochMetrics, OptimizerConfig, Pilot, PrunablePilot, PruneJob};
pub use prune::{
    channels_per_iteration, compute_apoz, plan_removal, target_channels, ChannelApoz,
    PruneIteration, PruneReport, PruneSettings, PruneStop, PruningController,
};

/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

/// Autodiff wrapper the trainer fits with.
pub type AutodiffTrainBackend = burn::backend::Autodiff<TrainBackend>;
