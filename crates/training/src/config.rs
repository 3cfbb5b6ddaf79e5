//! Trainer configuration, loaded from TOML.

use crate::error::{TrainError, TrainResult};
use models::{default_conv_stack, ConvLayerSpec};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tub_dataset::{BinSpec, CategoricalBins, ImageGeometry};

pub const CONFIG_ENV: &str = "TUB_TRAIN_CONFIG";
pub const DEFAULT_CONFIG_NAME: &str = "tub-train.toml";

/// Every knob the trainer reads. Missing keys fall back to [`TrainConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// Share of new samples assigned to training.
    pub train_test_split: f32,
    pub max_epochs: usize,
    pub use_early_stop: bool,
    pub early_stop_patience: usize,
    pub min_delta: f32,
    pub seed: Option<u64>,

    pub image_w: u32,
    pub image_h: u32,
    pub image_depth: u32,
    pub roi_crop_top: u32,
    pub roi_crop_bottom: u32,
    pub cache_images: bool,

    pub steering_bins: usize,
    pub throttle_bins: usize,
    pub categorical_max_throttle_range: f32,
    pub num_behavior_inputs: usize,

    pub sequence_length: usize,
    pub mask_look_ahead_history: bool,

    pub conv_layers: Vec<ConvLayerSpec>,
    pub dense_units: usize,
    pub dropout: f64,
    /// Only `adam` is accepted.
    pub optimizer: String,
    pub learning_rate: f64,
    /// Per-step learning-rate decay: `lr / (1 + decay * step)`.
    pub learning_rate_decay: f64,
    pub freeze_layers: bool,
    pub num_last_layers_to_train: usize,

    pub continuous_steps_per_epoch: usize,
    pub continuous_max_epochs: usize,
    pub min_records_to_train: usize,
    pub continuous_poll_secs: u64,

    pub send_best_model_to_pi: bool,
    pub pi_username: String,
    pub pi_hostname: String,
    pub pi_donkey_root: String,

    pub prune_cnn: bool,
    pub prune_percent_target: f32,
    pub prune_percent_per_iteration: f32,
    pub prune_val_loss_degradation_limit: f32,
    pub prune_eval_percent_of_dataset: f32,

    pub write_history: bool,
    /// Dataset progress log cadence in samples, 0 disables it.
    pub log_every_samples: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            train_test_split: 0.8,
            max_epochs: 100,
            use_early_stop: true,
            early_stop_patience: 5,
            min_delta: 0.0005,
            seed: None,
            image_w: 160,
            image_h: 120,
            image_depth: 3,
            roi_crop_top: 0,
            roi_crop_bottom: 0,
            cache_images: true,
            steering_bins: 15,
            throttle_bins: 20,
            categorical_max_throttle_range: 0.5,
            num_behavior_inputs: 2,
            sequence_length: 3,
            mask_look_ahead_history: true,
            conv_layers: default_conv_stack(),
            dense_units: 100,
            dropout: 0.1,
            optimizer: "adam".to_string(),
            learning_rate: 1e-3,
            learning_rate_decay: 0.0,
            freeze_layers: false,
            num_last_layers_to_train: 7,
            continuous_steps_per_epoch: 100,
            continuous_max_epochs: 100_000,
            min_records_to_train: 1000,
            continuous_poll_secs: 10,
            send_best_model_to_pi: false,
            pi_username: "pi".to_string(),
            pi_hostname: "donkeypi.local".to_string(),
            pi_donkey_root: "mycar".to_string(),
            prune_cnn: false,
            prune_percent_target: 75.0,
            prune_percent_per_iteration: 20.0,
            prune_val_loss_degradation_limit: 0.2,
            prune_eval_percent_of_dataset: 0.05,
            write_history: true,
            log_every_samples: 10_000,
        }
    }
}

impl TrainConfig {
    /// Reads `$TUB_TRAIN_CONFIG`, else `tub-train.toml` in the working directory,
    /// else defaults.
    pub fn load() -> TrainResult<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_path(Path::new(&path));
        }
        let default = Path::new(DEFAULT_CONFIG_NAME);
        if default.exists() {
            return Self::from_path(default);
        }
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        let cfg: Self = toml::from_str(&raw).map_err(|source| TrainError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> TrainResult<()> {
        let fail = |msg: &str| Err(TrainError::Config(msg.to_string()));
        if self.batch_size == 0 {
            return fail("batch_size must be positive");
        }
        if !(0.0..=1.0).contains(&self.train_test_split) {
            return fail("train_test_split must be within [0, 1]");
        }
        if self.image_depth != 1 && self.image_depth != 3 {
            return fail("image_depth must be 1 or 3");
        }
        if self.roi_crop_top + self.roi_crop_bottom >= self.image_h {
            return fail("roi crop removes the whole image");
        }
        if self.sequence_length == 0 {
            return fail("sequence_length must be positive");
        }
        if self.steering_bins < 2 || self.throttle_bins < 2 {
            return fail("categorical models need at least two bins");
        }
        if !self.optimizer.eq_ignore_ascii_case("adam") {
            return Err(TrainError::Config(format!(
                "unsupported optimizer {:?}",
                self.optimizer
            )));
        }
        if !(0.0..100.0).contains(&self.prune_percent_target)
            || self.prune_percent_per_iteration <= 0.0
        {
            return fail("prune percentages out of range");
        }
        if self.conv_layers.is_empty() {
            return fail("conv_layers must not be empty");
        }
        Ok(())
    }

    pub fn geometry(&self) -> ImageGeometry {
        ImageGeometry::new(self.image_w, self.image_h, self.image_depth)
            .with_crop(self.roi_crop_top, self.roi_crop_bottom)
    }

    pub fn categorical_bins(&self) -> CategoricalBins {
        CategoricalBins {
            steering: BinSpec::steering(self.steering_bins),
            throttle: BinSpec::throttle(self.throttle_bins, self.categorical_max_throttle_range),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.continuous_poll_secs)
    }

    pub fn log_every(&self) -> Option<usize> {
        (self.log_every_samples > 0).then_some(self.log_every_samples)
    }
}
