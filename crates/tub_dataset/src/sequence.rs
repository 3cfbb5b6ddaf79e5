//! Contiguous frame windows for sequence and look-ahead models.

use crate::aug::Augment;
use crate::batch::{decode_frames, Batch, Targets};
use crate::frame::ImageGeometry;
use crate::store::{RecordStore, SharedStore};
use crate::tensor::HostTensor;
use crate::types::{DatasetResult, Frame, Sample, SampleKey, TubDatasetError};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Consecutive keys of one tub, oldest first.
pub type Window = Vec<SampleKey>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceMode {
    /// `L` frames in, controls of the last frame out.
    Plain,
    /// `2L` frames per window: the first `L` are inputs, the last `L` are targets.
    LookAhead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceConfig {
    pub length: usize,
    pub mode: SequenceMode,
    /// Feed zeros instead of the observed control history to look-ahead models.
    pub mask_history: bool,
}

impl SequenceConfig {
    pub fn plain(length: usize) -> Self {
        Self {
            length,
            mode: SequenceMode::Plain,
            mask_history: true,
        }
    }

    pub fn look_ahead(length: usize) -> Self {
        Self {
            length,
            mode: SequenceMode::LookAhead,
            mask_history: true,
        }
    }

    /// Frames spanned by one window.
    pub fn window_len(&self) -> usize {
        match self.mode {
            SequenceMode::Plain => self.length,
            SequenceMode::LookAhead => self.length * 2,
        }
    }
}

/// Every run of `len` consecutive indices present in the store.
pub fn build_windows(store: &RecordStore, len: usize) -> Vec<Window> {
    if len == 0 {
        return Vec::new();
    }
    store
        .sorted_keys()
        .into_iter()
        .filter_map(|start| {
            let window: Window = (0..len as u64)
                .map(|i| start.offset(i))
                .collect::<Option<_>>()?;
            window.iter().all(|k| store.contains(k)).then_some(window)
        })
        .collect()
}

/// Shuffles and splits windows into train and validation sets. The validation
/// share is rounded up.
pub fn split_windows(
    mut windows: Vec<Window>,
    train_fraction: f32,
    rng: &mut dyn rand::RngCore,
) -> (Vec<Window>, Vec<Window>) {
    windows.shuffle(rng);
    let val_len = ((1.0 - train_fraction.clamp(0.0, 1.0)) * windows.len() as f32).ceil() as usize;
    let val = windows.split_off(windows.len() - val_len.min(windows.len()));
    (windows, val)
}

/// Endless batches of windows, reshuffled each traversal.
pub struct SequenceBatchGen {
    store: SharedStore,
    windows: Vec<Window>,
    cfg: SequenceConfig,
    batch_size: usize,
    geometry: ImageGeometry,
    cache_images: bool,
    augment: Option<Arc<dyn Augment>>,
    rng: rand::rngs::StdRng,
    cursor: usize,
    failed_in_a_row: usize,
    pub processed_batches: usize,
    pub skipped_errors: usize,
}

impl SequenceBatchGen {
    pub fn new(
        store: SharedStore,
        windows: Vec<Window>,
        cfg: SequenceConfig,
        batch_size: usize,
        geometry: ImageGeometry,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
        };
        let mut gen = Self {
            store,
            windows,
            cfg,
            batch_size: batch_size.max(1),
            geometry,
            cache_images: true,
            augment: None,
            rng,
            cursor: 0,
            failed_in_a_row: 0,
            processed_batches: 0,
            skipped_errors: 0,
        };
        gen.windows.shuffle(&mut gen.rng);
        gen
    }

    pub fn with_cache(mut self, cache_images: bool) -> Self {
        self.cache_images = cache_images;
        self
    }

    pub fn with_augment(mut self, augment: Option<Arc<dyn Augment>>) -> Self {
        self.augment = augment;
        self
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    fn materialize(&mut self, windows: &[Window]) -> DatasetResult<Batch> {
        let samples: Vec<Sample> = {
            let store = self.store.borrow();
            windows
                .iter()
                .flatten()
                .map(|k| {
                    store
                        .get(k)
                        .cloned()
                        .ok_or_else(|| TubDatasetError::Other(format!("sample {k} vanished")))
                })
                .collect::<DatasetResult<_>>()?
        };
        let frames = decode_frames(&samples, &self.geometry)?;
        if self.cache_images {
            let mut store = self.store.borrow_mut();
            for (sample, frame) in samples.iter().zip(frames.iter()) {
                if let Some(s) = store.get_mut(&sample.key) {
                    if s.cached_frame().is_none() {
                        s.attach_frame(frame.clone());
                    }
                }
            }
        }
        let frames: Vec<Frame> = frames
            .into_iter()
            .map(|f| {
                let mut frame = (*f).clone();
                if let Some(aug) = &self.augment {
                    aug.augment(&mut frame, &mut self.rng);
                }
                frame
            })
            .collect();
        assemble_windows(&samples, &frames, windows.len(), &self.cfg, &self.geometry)
    }
}

impl Iterator for SequenceBatchGen {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.windows.len() < self.batch_size {
            return None;
        }
        loop {
            if self.cursor + self.batch_size > self.windows.len() {
                self.windows.shuffle(&mut self.rng);
                self.cursor = 0;
                debug!(windows = self.windows.len(), "reshuffled sequence windows");
            }
            let chunk: Vec<Window> =
                self.windows[self.cursor..self.cursor + self.batch_size].to_vec();
            self.cursor += self.batch_size;
            match self.materialize(&chunk) {
                Ok(batch) => {
                    self.failed_in_a_row = 0;
                    self.processed_batches += 1;
                    return Some(batch);
                }
                Err(e) => {
                    warn!("dropping sequence batch: {e}");
                    self.skipped_errors += 1;
                    self.failed_in_a_row += 1;
                    self.cursor = self.windows.len();
                    if self.failed_in_a_row >= crate::batch::MAX_BARREN_TRAVERSALS {
                        return None;
                    }
                }
            }
        }
    }
}

fn assemble_windows(
    samples: &[Sample],
    frames: &[Frame],
    batch: usize,
    cfg: &SequenceConfig,
    geometry: &ImageGeometry,
) -> DatasetResult<Batch> {
    let span = cfg.window_len();
    let l = cfg.length;
    let [h, w, d] = geometry.frame_shape();
    let frame_len = h * w * d;

    let mut images = Vec::with_capacity(batch * l * frame_len);
    let mut targets = Vec::new();
    let mut history = Vec::new();
    for b in 0..batch {
        let win_samples = &samples[b * span..(b + 1) * span];
        let win_frames = &frames[b * span..(b + 1) * span];
        for frame in &win_frames[..l] {
            if frame.len() != frame_len {
                return Err(TubDatasetError::Other(format!(
                    "frame has {} values, expected {frame_len}",
                    frame.len()
                )));
            }
            images.extend_from_slice(&frame.pixels);
        }
        match cfg.mode {
            SequenceMode::Plain => {
                if let Some(last) = win_samples.last() {
                    targets.extend(last.control_pair());
                }
            }
            SequenceMode::LookAhead => {
                for s in &win_samples[..l] {
                    let pair = s.control_pair();
                    if cfg.mask_history {
                        history.resize(history.len() + pair.len(), 0.0);
                    } else {
                        history.extend(pair);
                    }
                }
                for s in &win_samples[l..] {
                    targets.extend(s.control_pair());
                }
            }
        }
    }

    let target_width = targets.len() / batch.max(1);
    let history = (cfg.mode == SequenceMode::LookAhead).then(|| {
        let width = history.len() / batch.max(1);
        HostTensor::new(history, vec![batch, width])
    });
    Ok(Batch {
        images: HostTensor::new(images, vec![batch, l, h, w, d]),
        inertial: None,
        behavior: None,
        history,
        targets: Targets::Paired(HostTensor::new(targets, vec![batch, target_width])),
    })
}
