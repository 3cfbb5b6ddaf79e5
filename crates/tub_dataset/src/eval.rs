//! Deterministic frame batches over a leading slice of the store.

use crate::frame::{load_frame, ImageGeometry};
use crate::store::RecordStore;
use crate::tensor::HostTensor;
use rayon::prelude::*;
use std::path::PathBuf;
use tracing::warn;

/// Frames-only batches covering the first `fraction` of the store in key order.
/// The last batch may be short. Unreadable frames are skipped. Holds no borrow of
/// the store.
#[derive(Debug, Clone)]
pub struct EvalFrames {
    images: Vec<PathBuf>,
    geometry: ImageGeometry,
    batch_size: usize,
    cursor: usize,
}

impl EvalFrames {
    pub fn new(
        store: &RecordStore,
        fraction: f32,
        batch_size: usize,
        geometry: ImageGeometry,
    ) -> Self {
        let take = (store.len() as f32 * fraction.clamp(0.0, 1.0)).floor() as usize;
        let mut samples = store.values();
        samples.sort_by(|a, b| a.key.cmp(&b.key));
        let images = samples.into_iter().take(take).map(|s| s.image_path).collect();
        Self {
            images,
            geometry,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.images.len()
    }
}

impl Iterator for EvalFrames {
    type Item = HostTensor;

    fn next(&mut self) -> Option<HostTensor> {
        while self.cursor < self.images.len() {
            let end = (self.cursor + self.batch_size).min(self.images.len());
            let slice = &self.images[self.cursor..end];
            self.cursor = end;
            let frames: Vec<_> = slice
                .par_iter()
                .filter_map(|p| match load_frame(p, &self.geometry) {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        warn!("skipping evaluation frame: {e}");
                        None
                    }
                })
                .collect();
            if frames.is_empty() {
                continue;
            }
            let [h, w, d] = self.geometry.frame_shape();
            let mut data = Vec::with_capacity(frames.len() * h * w * d);
            for f in &frames {
                data.extend_from_slice(&f.pixels);
            }
            return Some(HostTensor::new(data, vec![frames.len(), h, w, d]));
        }
        None
    }
}
