#![allow(dead_code)]

use data_contracts::TubRecord;
use image::{Rgb, RgbImage};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use training::{
    ArtifactPaths, BestModelHook, EpochMetrics, OptimizerConfig, Pilot, PrunablePilot, PruneJob,
    TrainConfig, TrainError, TrainResult,
};
use tub_dataset::{Batch, HostTensor, Topology};

pub const W: u32 = 8;
pub const H: u32 = 6;

/// Tub of `count` frames with 8x6 PNGs, inertial readings and behavior state.
pub fn create_synthetic_tub(root: &Path, name: &str, count: u64) -> anyhow::Result<PathBuf> {
    let tub = root.join(name);
    append_frames(&tub, 0, count)?;
    Ok(tub)
}

/// Writes frames `start..start + count` into `tub`, image first.
pub fn append_frames(tub: &Path, start: u64, count: u64) -> anyhow::Result<()> {
    fs::create_dir_all(tub)?;
    for i in start..start + count {
        let image = format!("{i}_cam.png");
        let mut img = RgbImage::new(W, H);
        for (x, _, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(i * 7 % 255) as u8, (x * 30) as u8, 90]);
        }
        img.save(tub.join(&image))?;
        let record = TubRecord {
            image,
            angle: (i as f32 / 7.0).sin(),
            throttle: 0.25,
            mode: Some("user".into()),
            imu: Some([0.0, 0.1, 9.8, 0.0, 0.0, 0.02]),
            behavior: Some(vec![0.0, 1.0]),
        };
        fs::write(
            tub.join(format!("record_{i}.json")),
            serde_json::to_vec(&record.to_json())?,
        )?;
    }
    Ok(())
}

/// Small config matching the synthetic tubs.
pub fn small_config() -> TrainConfig {
    TrainConfig {
        batch_size: 4,
        max_epochs: 4,
        use_early_stop: false,
        seed: Some(7),
        image_w: W,
        image_h: H,
        log_every_samples: 0,
        ..TrainConfig::default()
    }
}

/// Scripted pilot: each `fit_epoch` pops the next loss, then repeats `fallback`.
pub struct MockPilot {
    pub topology: Topology,
    pub losses: VecDeque<f32>,
    pub fallback: f32,
    pub channels: Vec<usize>,
    pub layers: usize,
    pub compiled: usize,
    pub epochs: usize,
    pub batches_seen: usize,
    pub val_batches_seen: usize,
    pub frozen: Option<usize>,
    pub loaded: Option<PathBuf>,
    pub saved: RefCell<Vec<PathBuf>>,
    /// Loss returned once the channel total drops below the threshold.
    pub degrade_below: Option<(usize, f32)>,
    /// Runs at the end of every `fit_epoch` with the epoch index.
    pub after_epoch: Option<Box<dyn FnMut(usize)>>,
}

impl MockPilot {
    pub fn new(losses: &[f32]) -> Self {
        Self {
            topology: Topology::split(),
            losses: losses.iter().copied().collect(),
            fallback: 0.1,
            channels: vec![50, 50],
            layers: 10,
            compiled: 0,
            epochs: 0,
            batches_seen: 0,
            val_batches_seen: 0,
            frozen: None,
            loaded: None,
            saved: RefCell::new(Vec::new()),
            degrade_below: None,
            after_epoch: None,
        }
    }

    pub fn saved_paths(&self) -> Vec<PathBuf> {
        self.saved.borrow().clone()
    }

    fn next_loss(&mut self) -> f32 {
        if let Some((threshold, loss)) = self.degrade_below {
            if self.total_channels() < threshold {
                return loss;
            }
        }
        self.losses.pop_front().unwrap_or(self.fallback)
    }
}

impl Pilot for MockPilot {
    fn topology(&self) -> Topology {
        self.topology
    }

    fn compile(&mut self, _optimizer: &OptimizerConfig) -> TrainResult<()> {
        self.compiled += 1;
        Ok(())
    }

    fn fit_epoch(
        &mut self,
        train: &mut dyn Iterator<Item = Batch>,
        steps: usize,
        val: &mut dyn Iterator<Item = Batch>,
        val_steps: usize,
    ) -> TrainResult<EpochMetrics> {
        let steps = train.take(steps).count();
        let val_steps = val.take(val_steps).count();
        self.batches_seen += steps;
        self.val_batches_seen += val_steps;
        if let Some(hook) = self.after_epoch.as_mut() {
            hook(self.epochs);
        }
        self.epochs += 1;
        let loss = self.next_loss();
        Ok(EpochMetrics {
            loss,
            val_loss: (val_steps > 0).then_some(loss),
            steps,
            val_steps,
        })
    }

    fn load(&mut self, path: &Path) -> TrainResult<()> {
        self.loaded = Some(path.to_path_buf());
        Ok(())
    }

    fn save(&self, path: &Path) -> TrainResult<()> {
        fs::write(path, b"mock").map_err(|e| TrainError::Checkpoint(e.to_string()))?;
        self.saved.borrow_mut().push(path.to_path_buf());
        Ok(())
    }

    fn save_weights(&self, path: &Path) -> TrainResult<()> {
        fs::write(path, b"weights").map_err(|e| TrainError::Checkpoint(e.to_string()))
    }

    fn architecture(&self) -> serde_json::Value {
        serde_json::json!({ "class_name": "MockPilot", "channels": self.channels })
    }

    fn layer_count(&self) -> usize {
        self.layers
    }

    fn freeze_leading(&mut self, count: usize) {
        self.frozen = Some(count);
    }
}

impl PrunablePilot for MockPilot {
    fn conv_channels(&self) -> Vec<usize> {
        self.channels.clone()
    }

    /// Channel `c` of a layer with `n` channels scores `c / n`.
    fn conv_zero_fractions(&self, _images: &HostTensor) -> TrainResult<Vec<Vec<f32>>> {
        Ok(self
            .channels
            .iter()
            .map(|&n| (0..n).map(|c| c as f32 / n as f32).collect())
            .collect())
    }

    fn delete_channels(&mut self, jobs: &[PruneJob]) -> TrainResult<()> {
        for job in jobs {
            self.channels[job.layer] -= job.channels.len();
        }
        Ok(())
    }
}

/// Counts best-model notifications, optionally failing each one.
pub struct RecordingHook {
    pub calls: std::rc::Rc<RefCell<usize>>,
    pub fail: bool,
}

impl BestModelHook for RecordingHook {
    fn on_best(
        &mut self,
        _config: &TrainConfig,
        _model: &dyn Pilot,
        _artifacts: &ArtifactPaths,
    ) -> TrainResult<()> {
        *self.calls.borrow_mut() += 1;
        if self.fail {
            return Err(TrainError::Checkpoint("remote unreachable".into()));
        }
        Ok(())
    }
}
