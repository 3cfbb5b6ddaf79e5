//! Conversion of compressed legacy frame archives into regular tub records.

use crate::types::{DatasetResult, TubDatasetError};
use data_contracts::{LegacyArchive, RawImage};
use flate2::read::ZlibDecoder;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File extension of legacy archives.
pub const ARCHIVE_EXTENSION: &str = "zframe";

/// Record and image paths a legacy archive expands into.
pub fn converted_paths(archive: &Path) -> Option<(PathBuf, PathBuf)> {
    let dir = archive.parent()?;
    let name = archive.file_stem()?.to_str()?;
    Some((
        dir.join(format!("record_{name}.json")),
        dir.join(format!("{name}.jpg")),
    ))
}

/// Writes `<name>.jpg` and `record_<name>.json` next to the archive. Returns false
/// when the record already exists.
pub fn convert_archive(archive: &Path) -> DatasetResult<bool> {
    let (record_path, image_path) = converted_paths(archive).ok_or_else(|| {
        TubDatasetError::Other(format!("unusable archive name {}", archive.display()))
    })?;
    if record_path.exists() {
        return Ok(false);
    }
    let compressed = fs::read(archive).map_err(|source| TubDatasetError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut raw = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut raw)
        .map_err(|source| TubDatasetError::Io {
            path: archive.to_path_buf(),
            source,
        })?;
    let mut parsed = LegacyArchive::from_slice(&raw).map_err(|source| TubDatasetError::Record {
        path: archive.to_path_buf(),
        source,
    })?;
    let image = parsed.take_image().map_err(|source| TubDatasetError::Record {
        path: archive.to_path_buf(),
        source,
    })?;
    write_image(&image, &image_path)?;

    let image_name = image_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let record = parsed.into_record_json(&image_name);
    let body = serde_json::to_vec(&record).map_err(|source| TubDatasetError::Json {
        path: record_path.clone(),
        source,
    })?;
    fs::write(&record_path, body).map_err(|source| TubDatasetError::Io {
        path: record_path.clone(),
        source,
    })?;
    Ok(true)
}

fn write_image(image: &RawImage, path: &Path) -> DatasetResult<()> {
    let bad_shape = || {
        TubDatasetError::Other(format!(
            "archive frame {}x{}x{} does not match its pixel count",
            image.width, image.height, image.channels
        ))
    };
    let result = match image.channels {
        1 => image::GrayImage::from_raw(image.width, image.height, image.pixels.clone())
            .ok_or_else(bad_shape)?
            .save(path),
        _ => image::RgbImage::from_raw(image.width, image.height, image.pixels.clone())
            .ok_or_else(bad_shape)?
            .save(path),
    };
    result.map_err(|source| TubDatasetError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Converts every archive found directly inside `tubs`. Failures are logged and
/// skipped. Returns how many archives were newly converted.
pub fn extract_legacy_archives(tubs: &[PathBuf]) -> usize {
    let mut converted = 0usize;
    for tub in tubs {
        let Ok(entries) = fs::read_dir(tub) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == ARCHIVE_EXTENSION) {
                continue;
            }
            match convert_archive(&path) {
                Ok(true) => converted += 1,
                Ok(false) => {}
                Err(e) => warn!("skipping legacy archive: {e}"),
            }
        }
    }
    if converted > 0 {
        info!(converted, "extracted legacy archives");
    }
    converted
}
