//! Core types, error definitions, and sample metadata for tub_dataset.

use data_contracts::RecordError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, TubDatasetError>;

#[derive(Debug, Error)]
pub enum TubDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("bad record at {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: RecordError,
    },
    #[error("record {path} has no usable index in its file name")]
    RecordIndex { path: PathBuf },
    #[error("image file missing for record {path}: {image}")]
    MissingImageFile { path: PathBuf, image: PathBuf },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{0}")]
    Other(String),
}

/// Identity of one frame: the tub directory it came from plus its record index.
///
/// Displayed as the tub path immediately followed by the index. The structured form
/// is what is compared, so `tub1` + `12` and `tub11` + `2` never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey {
    pub tub: PathBuf,
    pub index: u64,
}

impl SampleKey {
    pub fn new(tub: impl Into<PathBuf>, index: u64) -> Self {
        Self {
            tub: tub.into(),
            index,
        }
    }

    /// Key of the frame `offset` positions later in the same tub, `None` past
    /// `u64::MAX`.
    pub fn offset(&self, offset: u64) -> Option<Self> {
        Some(Self {
            tub: self.tub.clone(),
            index: self.index.checked_add(offset)?,
        })
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.tub.display(), self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Train,
    Validation,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Validation => "validation",
        }
    }
}

/// A control target: either the raw scalar or a one-hot bin encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Scalar(f32),
    Binned(Vec<f32>),
}

impl Control {
    pub fn values(&self) -> &[f32] {
        match self {
            Control::Scalar(v) => std::slice::from_ref(v),
            Control::Binned(bins) => bins,
        }
    }

    pub fn width(&self) -> usize {
        self.values().len()
    }
}

/// Decoded pixels in HWC layout, normalized to [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub pixels: Vec<f32>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Which inputs a model consumes and which outputs it predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Topology {
    pub inertial_input: bool,
    pub behavior_input: bool,
    /// Adds a single-channel 127x127 reconstruction target.
    pub image_output: bool,
    /// One concatenated control target instead of separate steering and throttle.
    pub paired_output: bool,
}

impl Topology {
    pub fn paired() -> Self {
        Self {
            paired_output: true,
            ..Self::default()
        }
    }

    pub fn split() -> Self {
        Self::default()
    }
}

/// A fully parsed frame and its metadata. The partition is fixed at creation.
#[derive(Debug, Clone)]
pub struct Sample {
    pub key: SampleKey,
    pub record_path: PathBuf,
    pub image_path: PathBuf,
    pub steering: Control,
    pub throttle: Control,
    pub inertial: Option<[f32; 6]>,
    pub behavior: Option<Vec<f32>>,
    partition: Partition,
    cached: Option<Arc<Frame>>,
}

impl Sample {
    pub fn new(
        key: SampleKey,
        record_path: PathBuf,
        image_path: PathBuf,
        steering: Control,
        throttle: Control,
        partition: Partition,
    ) -> Self {
        Self {
            key,
            record_path,
            image_path,
            steering,
            throttle,
            inertial: None,
            behavior: None,
            partition,
            cached: None,
        }
    }

    pub fn with_inertial(mut self, inertial: Option<[f32; 6]>) -> Self {
        self.inertial = inertial;
        self
    }

    pub fn with_behavior(mut self, behavior: Option<Vec<f32>>) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn cached_frame(&self) -> Option<&Arc<Frame>> {
        self.cached.as_ref()
    }

    pub(crate) fn attach_frame(&mut self, frame: Arc<Frame>) {
        self.cached = Some(frame);
    }

    /// Steering values followed by throttle values.
    pub fn control_pair(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.steering.width() + self.throttle.width());
        out.extend_from_slice(self.steering.values());
        out.extend_from_slice(self.throttle.values());
        out
    }
}

/// Notifications the continuous batch generator publishes while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetEvent {
    Grew { before: usize, after: usize },
    Waiting { have: usize, need: usize },
    Evicted { key: SampleKey },
}
