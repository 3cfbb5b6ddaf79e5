//! Discovering tubs, parsing records, and adding them to a store.

use crate::binning::CategoricalBins;
use crate::store::RecordStore;
use crate::types::{Control, DatasetResult, Partition, Sample, SampleKey, TubDatasetError};
use data_contracts::TubRecord;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Options that shape how records become samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOptions {
    /// When set, controls are stored as one-hot bins instead of scalars.
    pub categorical: Option<CategoricalBins>,
    /// Probability that a new sample joins the training partition.
    pub train_fraction: f32,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            categorical: None,
            train_fraction: 0.8,
        }
    }
}

/// Record index from a `record_<index>[_suffix].json` file name.
pub fn record_index(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix("record_")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn is_record_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "json") && record_index(path).is_some()
}

/// Record files of every tub, each tub's files in index order. Unreadable tubs are
/// skipped with a warning.
pub fn gather_records(tubs: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for tub in tubs {
        let entries = match fs::read_dir(tub) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(tub = %tub.display(), "skipping unreadable tub: {e}");
                continue;
            }
        };
        let mut records: Vec<(u64, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| tub.join(e.file_name()))
            .filter(|p| is_record_file(p))
            .filter_map(|p| record_index(&p).map(|i| (i, p)))
            .collect();
        records.sort();
        out.extend(records.into_iter().map(|(_, p)| p));
    }
    out
}

/// Parses one record file into a sample, assigning `partition`.
pub fn parse_sample(
    record_path: &Path,
    opts: &IngestOptions,
    partition: Partition,
) -> DatasetResult<Sample> {
    let index = record_index(record_path).ok_or_else(|| TubDatasetError::RecordIndex {
        path: record_path.to_path_buf(),
    })?;
    let tub = record_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let raw = fs::read(record_path).map_err(|source| TubDatasetError::Io {
        path: record_path.to_path_buf(),
        source,
    })?;
    let record = TubRecord::from_slice(&raw).map_err(|source| TubDatasetError::Record {
        path: record_path.to_path_buf(),
        source,
    })?;
    let image_path = tub.join(&record.image);
    if !image_path.is_file() {
        return Err(TubDatasetError::MissingImageFile {
            path: record_path.to_path_buf(),
            image: image_path,
        });
    }

    let (steering, throttle) = match &opts.categorical {
        Some(bins) => (
            Control::Binned(bins.steering.encode(record.angle)),
            Control::Binned(bins.throttle.encode(record.throttle)),
        ),
        None => (
            Control::Scalar(record.angle),
            Control::Scalar(record.throttle),
        ),
    };
    Ok(Sample::new(
        SampleKey::new(tub, index),
        record_path.to_path_buf(),
        image_path,
        steering,
        throttle,
        partition,
    )
    .with_inertial(record.imu)
    .with_behavior(record.behavior))
}

/// Adds every record not already in `store`. Bad records are logged and skipped.
/// Returns the number of samples added.
pub fn collate_records(
    records: &[PathBuf],
    store: &mut RecordStore,
    opts: &IngestOptions,
    rng: &mut dyn rand::RngCore,
) -> usize {
    let mut added = 0usize;
    let mut skipped = 0usize;
    for path in records {
        let Some(index) = record_index(path) else {
            continue;
        };
        let tub = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if store.contains(&SampleKey::new(tub, index)) {
            continue;
        }
        let partition = if rng.random_range(0.0..1.0) < opts.train_fraction {
            Partition::Train
        } else {
            Partition::Validation
        };
        match parse_sample(path, opts, partition) {
            Ok(sample) => {
                if store.insert(sample) {
                    added += 1;
                }
            }
            Err(e) => {
                skipped += 1;
                debug!("skipping record: {e}");
            }
        }
    }
    debug!(added, skipped, total = store.len(), "collated records");
    added
}

/// Gathers and collates all records under `tubs`.
pub fn ingest_tubs(
    tubs: &[PathBuf],
    store: &mut RecordStore,
    opts: &IngestOptions,
    rng: &mut dyn rand::RngCore,
) -> usize {
    let records = gather_records(tubs);
    collate_records(&records, store, opts, rng)
}

/// Tub directories listed one per line. Blank lines and `#` comments are ignored;
/// relative entries resolve against the list file's directory.
pub fn read_tub_list(path: &Path) -> DatasetResult<Vec<PathBuf>> {
    let raw = fs::read_to_string(path).map_err(|source| TubDatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            let p = expand_home(l);
            if p.is_absolute() {
                p
            } else {
                base.join(p)
            }
        })
        .collect())
}

/// Splits a comma separated tub argument, expanding a leading `~`.
pub fn expand_tub_arg(arg: &str) -> Vec<PathBuf> {
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(expand_home)
        .collect()
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_index_parses_suffixes() {
        assert_eq!(record_index(Path::new("/t/record_12.json")), Some(12));
        assert_eq!(record_index(Path::new("record_7_cam.json")), Some(7));
        assert_eq!(record_index(Path::new("meta.json")), None);
        assert_eq!(record_index(Path::new("record_.json")), None);
    }

    #[test]
    fn tub_arg_splits_on_commas() {
        let tubs = expand_tub_arg("a, b,,c");
        assert_eq!(
            tubs,
            vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]
        );
    }
}
