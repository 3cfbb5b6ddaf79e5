//! The model abstraction the controllers drive.

use crate::error::TrainResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tub_dataset::{Batch, HostTensor, Topology};

/// Losses for one epoch. `val_loss` is absent when no validation batch was drawn.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f32,
    pub val_loss: Option<f32>,
    pub steps: usize,
    pub val_steps: usize,
}

impl EpochMetrics {
    /// Validation loss when available, else training loss.
    pub fn monitored(&self) -> f32 {
        self.val_loss.unwrap_or(self.loss)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            decay: 0.0,
        }
    }
}

/// A trainable steering model.
pub trait Pilot {
    fn topology(&self) -> Topology;

    /// (Re)creates optimizer state. Must run before the first `fit_epoch` and after
    /// any structural change.
    fn compile(&mut self, optimizer: &OptimizerConfig) -> TrainResult<()>;

    /// Draws up to `steps` training batches and `val_steps` validation batches.
    /// Stops early if an iterator ends.
    fn fit_epoch(
        &mut self,
        train: &mut dyn Iterator<Item = Batch>,
        steps: usize,
        val: &mut dyn Iterator<Item = Batch>,
        val_steps: usize,
    ) -> TrainResult<EpochMetrics>;

    /// Restores weights, and architecture when one sits next to the file.
    fn load(&mut self, path: &Path) -> TrainResult<()>;

    /// Full checkpoint at exactly `path`.
    fn save(&self, path: &Path) -> TrainResult<()>;

    /// Raw weights only, at exactly `path`.
    fn save_weights(&self, path: &Path) -> TrainResult<()>;

    /// Serializable description of the network layout.
    fn architecture(&self) -> serde_json::Value;

    fn layer_count(&self) -> usize;

    fn freeze_leading(&mut self, count: usize);
}

/// Conv channels to drop from one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneJob {
    pub layer: usize,
    pub channels: Vec<usize>,
}

/// A pilot whose conv channels can be scored and removed.
pub trait PrunablePilot: Pilot {
    /// Output channels per conv layer.
    fn conv_channels(&self) -> Vec<usize>;

    fn total_channels(&self) -> usize {
        self.conv_channels().iter().sum()
    }

    /// Fraction of zero activations per channel for one `[B, H, W, D]` batch,
    /// indexed `[layer][channel]`.
    fn conv_zero_fractions(&self, images: &HostTensor) -> TrainResult<Vec<Vec<f32>>>;

    fn delete_channels(&mut self, jobs: &[PruneJob]) -> TrainResult<()>;
}
