#![allow(dead_code)]

use data_contracts::TubRecord;
use image::{Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};

pub const W: u32 = 8;
pub const H: u32 = 6;

/// Writes `record_<index>.json` plus an 8x6 PNG into `tub`.
pub fn write_frame(
    tub: &Path,
    index: u64,
    angle: f32,
    throttle: f32,
    imu: Option<[f32; 6]>,
    behavior: Option<Vec<f32>>,
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(tub)?;
    let image = format!("{index}_cam.png");
    let mut img = RgbImage::new(W, H);
    for pixel in img.pixels_mut() {
        *pixel = Rgb([((index % 255) * 10 % 255) as u8, 128, 200]);
    }
    img.save(tub.join(&image))?;
    let record = TubRecord {
        image,
        angle,
        throttle,
        mode: Some("user".into()),
        imu,
        behavior,
    };
    let path = tub.join(format!("record_{index}.json"));
    fs::write(&path, serde_json::to_vec(&record.to_json())?)?;
    Ok(path)
}

/// Synthetic tub with `count` consecutive frames starting at `start`.
pub fn create_synthetic_tub(
    root: &Path,
    name: &str,
    start: u64,
    count: u64,
) -> anyhow::Result<PathBuf> {
    let tub = root.join(name);
    for i in start..start + count {
        let angle = (i as f32 / 10.0).sin();
        let imu = Some([0.1, 0.2, 9.8, 0.0, 0.0, 0.01]);
        write_frame(&tub, i, angle, 0.3, imu, Some(vec![1.0, 0.0]))?;
    }
    Ok(tub)
}

pub fn image_path(tub: &Path, index: u64) -> PathBuf {
    tub.join(format!("{index}_cam.png"))
}
