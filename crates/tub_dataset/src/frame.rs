//! Image decoding, region-of-interest cropping, and reconstruction targets.

use crate::types::{DatasetResult, Frame, TubDatasetError};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Side length of the single-channel reconstruction target.
pub const RECONSTRUCTION_SIDE: u32 = 127;

/// Expected camera geometry. Frames of any other size are resized on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub width: u32,
    pub height: u32,
    /// 1 for grayscale, 3 for RGB.
    pub depth: u32,
    /// Rows removed from the top after resizing.
    pub crop_top: u32,
    /// Rows removed from the bottom after resizing.
    pub crop_bottom: u32,
}

impl Default for ImageGeometry {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            depth: 3,
            crop_top: 0,
            crop_bottom: 0,
        }
    }
}

impl ImageGeometry {
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
            crop_top: 0,
            crop_bottom: 0,
        }
    }

    pub fn with_crop(mut self, top: u32, bottom: u32) -> Self {
        self.crop_top = top;
        self.crop_bottom = bottom;
        self
    }

    /// Height of the frame handed to the model, after cropping.
    pub fn output_height(&self) -> u32 {
        self.height
            .saturating_sub(self.crop_top)
            .saturating_sub(self.crop_bottom)
    }

    /// `[H, W, D]` of one decoded frame.
    pub fn frame_shape(&self) -> [usize; 3] {
        [
            self.output_height() as usize,
            self.width as usize,
            self.depth as usize,
        ]
    }

    pub fn frame_len(&self) -> usize {
        self.frame_shape().iter().product()
    }
}

/// Decodes, resizes, converts, crops and normalizes one camera frame.
pub fn load_frame(path: &Path, geometry: &ImageGeometry) -> DatasetResult<Frame> {
    if geometry.output_height() == 0 {
        return Err(TubDatasetError::Other(format!(
            "crop of {}+{} rows leaves nothing of a {}-row image",
            geometry.crop_top, geometry.crop_bottom, geometry.height
        )));
    }
    let img = image::open(path).map_err(|source| TubDatasetError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let (w, h) = (geometry.width, geometry.height);
    let img = if img.width() != w || img.height() != h {
        img.resize_exact(w, h, FilterType::Triangle)
    } else {
        img
    };

    let raw: Vec<u8> = match geometry.depth {
        1 => img.to_luma8().into_raw(),
        3 => img.to_rgb8().into_raw(),
        other => {
            return Err(TubDatasetError::Other(format!(
                "unsupported image depth {other}"
            )))
        }
    };

    let row = (w * geometry.depth) as usize;
    let start = geometry.crop_top as usize * row;
    let end = start + geometry.output_height() as usize * row;
    let pixels = raw[start..end]
        .iter()
        .map(|v| *v as f32 / 255.0)
        .collect();
    Ok(Frame {
        width: w,
        height: geometry.output_height(),
        depth: geometry.depth,
        pixels,
    })
}

/// First channel of `frame`, resized to 127x127, values in [0, 1].
pub fn reconstruction_target(frame: &Frame) -> Vec<f32> {
    let depth = frame.depth.max(1) as usize;
    let first: Vec<u8> = frame
        .pixels
        .iter()
        .step_by(depth)
        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    let Some(gray) = image::GrayImage::from_raw(frame.width, frame.height, first) else {
        return vec![0.0; (RECONSTRUCTION_SIDE * RECONSTRUCTION_SIDE) as usize];
    };
    image::imageops::resize(
        &gray,
        RECONSTRUCTION_SIDE,
        RECONSTRUCTION_SIDE,
        FilterType::Triangle,
    )
    .into_raw()
    .into_iter()
    .map(|v| v as f32 / 255.0)
    .collect()
}
