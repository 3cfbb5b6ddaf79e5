//! Endless shuffled batch generation over one partition of the record store.

use crate::aug::Augment;
use crate::frame::{load_frame, reconstruction_target, ImageGeometry, RECONSTRUCTION_SIDE};
use crate::index::{ingest_tubs, IngestOptions};
use crate::store::SharedStore;
use crate::tensor::HostTensor;
use crate::types::{
    DatasetEvent, DatasetResult, Frame, Partition, Sample, SampleKey, Topology, TubDatasetError,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 10_000;
/// Consecutive traversals without a single batch before a finite generator gives up.
pub(crate) const MAX_BARREN_TRAVERSALS: usize = 8;

/// Supervised targets, laid out according to the model topology.
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    /// `[B, steering_width + throttle_width]`.
    Paired(HostTensor),
    /// `[B, steering_width]` and `[B, throttle_width]`.
    Split {
        steering: HostTensor,
        throttle: HostTensor,
    },
    /// `[B, 127, 127, 1]` image plus split controls.
    Reconstruction {
        image: HostTensor,
        steering: HostTensor,
        throttle: HostTensor,
    },
}

/// One batch of model inputs and targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[B, H, W, D]` for single frames, `[B, L, H, W, D]` for sequences.
    pub images: HostTensor,
    /// `[B, 6]`.
    pub inertial: Option<HostTensor>,
    /// `[B, behavior_width]`.
    pub behavior: Option<HostTensor>,
    /// `[B, 2L]` control history fed to look-ahead models.
    pub history: Option<HostTensor>,
    pub targets: Targets,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.batch()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Re-ingestion settings for continuous training.
#[derive(Debug, Clone)]
pub struct ContinuousConfig {
    pub tubs: Vec<PathBuf>,
    pub ingest: IngestOptions,
    /// Training does not start until the store holds at least this many samples.
    pub min_records: usize,
    pub poll_interval: Duration,
}

#[derive(Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub geometry: ImageGeometry,
    pub cache_images: bool,
    pub augment: Option<Arc<dyn Augment>>,
    pub continuous: Option<ContinuousConfig>,
    pub seed: Option<u64>,
    pub log_every_samples: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 128,
            geometry: ImageGeometry::default(),
            cache_images: true,
            augment: None,
            continuous: None,
            seed: None,
            log_every_samples: Some(DEFAULT_LOG_EVERY_SAMPLES),
        }
    }
}

impl std::fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("batch_size", &self.batch_size)
            .field("geometry", &self.geometry)
            .field("cache_images", &self.cache_images)
            .field("augment", &self.augment.as_ref().map(|a| a.describe()))
            .field("continuous", &self.continuous)
            .field("seed", &self.seed)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenStats {
    pub processed_batches: usize,
    pub processed_samples: usize,
    pub skipped_errors: usize,
    pub evicted: usize,
    /// Traversals started so far, including the current one.
    pub traversals: usize,
}

/// Shuffles the partition's keys once per traversal and yields full batches.
///
/// Outside continuous mode the iterator only ends when the partition can never
/// fill a batch: fewer samples than `batch_size`, or repeated traversals that all
/// failed. In continuous mode the training partition waits for data and never
/// ends, while other partitions return `None` for a pass that cannot fill a
/// batch and start over on the next call.
pub struct TubBatchGen {
    store: SharedStore,
    partition: Partition,
    topology: Topology,
    opts: BatchOptions,
    rng: rand::rngs::StdRng,
    keys: Vec<SampleKey>,
    cursor: usize,
    pending: Vec<SampleKey>,
    batches_this_traversal: usize,
    barren_traversals: usize,
    in_traversal: bool,
    events: Option<Sender<DatasetEvent>>,
    stats: GenStats,
    started: Instant,
    last_log: Instant,
    last_logged_samples: usize,
}

impl TubBatchGen {
    pub fn new(
        store: SharedStore,
        partition: Partition,
        topology: Topology,
        opts: BatchOptions,
    ) -> Self {
        let rng = match opts.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
        };
        let now = Instant::now();
        Self {
            store,
            partition,
            topology,
            opts,
            rng,
            keys: Vec::new(),
            cursor: 0,
            pending: Vec::new(),
            batches_this_traversal: 0,
            barren_traversals: 0,
            in_traversal: false,
            events: None,
            stats: GenStats::default(),
            started: now,
            last_log: now,
            last_logged_samples: 0,
        }
    }

    /// Publish growth, waiting, and eviction notices on `tx`.
    pub fn with_events(mut self, tx: Sender<DatasetEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn stats(&self) -> &GenStats {
        &self.stats
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    fn emit(&self, event: DatasetEvent) {
        if let Some(tx) = &self.events {
            // The receiver going away only means nobody listens any more.
            let _ = tx.send(event);
        }
    }

    fn is_continuous(&self) -> bool {
        self.opts.continuous.is_some()
    }

    /// Re-ingests configured tubs. Only the training generator drives this.
    fn refresh(&mut self) {
        let Some(cfg) = self.opts.continuous.clone() else {
            return;
        };
        if self.partition != Partition::Train {
            return;
        }
        let before = self.store.borrow().len();
        let added = ingest_tubs(
            &cfg.tubs,
            &mut self.store.borrow_mut(),
            &cfg.ingest,
            &mut self.rng,
        );
        if added > 0 {
            let after = self.store.borrow().len();
            info!(before, after, "picked up new records");
            self.emit(DatasetEvent::Grew { before, after });
        }
    }

    fn wait_for_records(&mut self) {
        let Some(cfg) = self.opts.continuous.clone() else {
            return;
        };
        loop {
            self.refresh();
            let have = self.store.borrow().len();
            if have >= cfg.min_records || self.partition != Partition::Train {
                return;
            }
            info!(have, need = cfg.min_records, "not enough records to train, waiting");
            self.emit(DatasetEvent::Waiting {
                have,
                need: cfg.min_records,
            });
            std::thread::sleep(cfg.poll_interval);
        }
    }

    /// Prepares a fresh shuffled pass. Returns false when iteration should end.
    ///
    /// Continuous training never ends: it waits for data instead. Other continuous
    /// partitions end the current pass when they cannot fill a batch, and resume on
    /// the next call.
    fn start_traversal(&mut self) -> bool {
        if std::mem::take(&mut self.in_traversal) {
            if self.batches_this_traversal == 0 {
                self.barren_traversals += 1;
            } else {
                self.barren_traversals = 0;
            }
        }
        self.pending.clear();
        self.batches_this_traversal = 0;
        self.keys.clear();
        self.cursor = 0;

        let waits = self.is_continuous() && self.partition == Partition::Train;
        if self.is_continuous() && self.barren_traversals > 0 {
            if !waits {
                self.barren_traversals = 0;
                debug!(partition = self.partition.as_str(), "no eligible batch this pass");
                return false;
            }
            if self.barren_traversals == MAX_BARREN_TRAVERSALS {
                warn!(
                    partition = self.partition.as_str(),
                    traversals = self.barren_traversals,
                    "repeated traversals without a batch, still waiting for data"
                );
            }
            self.pause();
        }

        self.wait_for_records();
        let available = self.store.borrow().count(self.partition);
        if available < self.opts.batch_size.max(1) {
            if !waits {
                return false;
            }
            debug!(
                partition = self.partition.as_str(),
                available, "partition cannot fill a batch yet"
            );
            self.emit(DatasetEvent::Waiting {
                have: available,
                need: self.opts.batch_size,
            });
            self.pause();
            return true;
        }
        if !self.is_continuous() && self.barren_traversals >= MAX_BARREN_TRAVERSALS {
            warn!(
                partition = self.partition.as_str(),
                traversals = self.barren_traversals,
                "giving up after repeated traversals without a batch"
            );
            return false;
        }

        self.keys = self.store.borrow().keys_in(self.partition);
        self.keys.shuffle(&mut self.rng);
        self.stats.traversals += 1;
        self.in_traversal = true;
        true
    }

    fn pause(&self) {
        if let Some(cfg) = &self.opts.continuous {
            std::thread::sleep(cfg.poll_interval);
        }
    }

    /// Checks that `key` is still usable, evicting it when its image vanished.
    fn eligible(&mut self, key: &SampleKey) -> bool {
        let image_path = {
            let store = self.store.borrow();
            let Some(sample) = store.get(key) else {
                return false;
            };
            if sample.partition() != self.partition
                || (self.topology.inertial_input && sample.inertial.is_none())
                || (self.topology.behavior_input && sample.behavior.is_none())
            {
                return false;
            }
            sample.image_path.clone()
        };
        if self.is_continuous() && !image_path.exists() {
            self.store.borrow_mut().remove(key);
            self.stats.evicted += 1;
            debug!(key = %key, "evicted sample whose image disappeared");
            self.emit(DatasetEvent::Evicted { key: key.clone() });
            return false;
        }
        true
    }

    fn materialize(&mut self, keys: &[SampleKey]) -> DatasetResult<Batch> {
        let samples: Vec<Sample> = {
            let store = self.store.borrow();
            keys.iter()
                .map(|k| {
                    store
                        .get(k)
                        .cloned()
                        .ok_or_else(|| TubDatasetError::Other(format!("sample {k} vanished")))
                })
                .collect::<DatasetResult<_>>()?
        };
        let frames = decode_frames(&samples, &self.opts.geometry)?;
        if self.opts.cache_images {
            let mut store = self.store.borrow_mut();
            for (sample, frame) in samples.iter().zip(frames.iter()) {
                if sample.cached_frame().is_none() {
                    if let Some(s) = store.get_mut(&sample.key) {
                        s.attach_frame(frame.clone());
                    }
                }
            }
        }
        let frames: Vec<Frame> = frames
            .into_iter()
            .map(|f| {
                let mut frame = (*f).clone();
                if let Some(aug) = &self.opts.augment {
                    aug.augment(&mut frame, &mut self.rng);
                }
                frame
            })
            .collect();
        assemble_batch(&samples, &frames, &self.opts.geometry, self.topology)
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.opts.log_every_samples else {
            return;
        };
        let since = self
            .stats
            .processed_samples
            .saturating_sub(self.last_logged_samples);
        if since < threshold && self.last_log.elapsed() < Duration::from_secs(30) {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        info!(
            partition = self.partition.as_str(),
            batches = self.stats.processed_batches,
            samples = self.stats.processed_samples,
            skipped_errors = self.stats.skipped_errors,
            evicted = self.stats.evicted,
            img_per_sec = self.stats.processed_samples as f32 / secs,
            "[dataset] progress"
        );
        self.last_logged_samples = self.stats.processed_samples;
        self.last_log = Instant::now();
    }
}

impl Iterator for TubBatchGen {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        loop {
            if self.cursor >= self.keys.len() {
                if !self.start_traversal() {
                    return None;
                }
                continue;
            }
            let key = self.keys[self.cursor].clone();
            self.cursor += 1;
            if !self.eligible(&key) {
                continue;
            }
            self.pending.push(key);
            if self.pending.len() < self.opts.batch_size {
                continue;
            }
            let keys = std::mem::take(&mut self.pending);
            match self.materialize(&keys) {
                Ok(batch) => {
                    self.batches_this_traversal += 1;
                    self.stats.processed_batches += 1;
                    self.stats.processed_samples += batch.len();
                    self.maybe_log_progress();
                    return Some(batch);
                }
                Err(e) => {
                    warn!("dropping batch and reshuffling: {e}");
                    self.stats.skipped_errors += 1;
                    self.cursor = self.keys.len();
                }
            }
        }
    }
}

/// Decodes uncached frames in parallel; cached frames are reused.
pub(crate) fn decode_frames(
    samples: &[Sample],
    geometry: &ImageGeometry,
) -> DatasetResult<Vec<Arc<Frame>>> {
    samples
        .par_iter()
        .map(|s| match s.cached_frame() {
            Some(frame) => Ok(frame.clone()),
            None => load_frame(&s.image_path, geometry).map(Arc::new),
        })
        .collect()
}

fn stack_rows<'a>(rows: impl Iterator<Item = &'a [f32]>, what: &str) -> DatasetResult<HostTensor> {
    let mut data = Vec::new();
    let mut width: Option<usize> = None;
    let mut count = 0usize;
    for row in rows {
        match width {
            None => width = Some(row.len()),
            Some(w) if w != row.len() => {
                return Err(TubDatasetError::Other(format!(
                    "{what} rows differ in width ({w} vs {})",
                    row.len()
                )))
            }
            _ => {}
        }
        data.extend_from_slice(row);
        count += 1;
    }
    Ok(HostTensor::new(data, vec![count, width.unwrap_or(0)]))
}

pub(crate) fn control_targets(samples: &[Sample], topology: Topology) -> DatasetResult<Targets> {
    if topology.paired_output {
        let pairs: Vec<Vec<f32>> = samples.iter().map(Sample::control_pair).collect();
        return Ok(Targets::Paired(stack_rows(
            pairs.iter().map(Vec::as_slice),
            "control",
        )?));
    }
    let steering = stack_rows(samples.iter().map(|s| s.steering.values()), "steering")?;
    let throttle = stack_rows(samples.iter().map(|s| s.throttle.values()), "throttle")?;
    Ok(Targets::Split { steering, throttle })
}

fn assemble_batch(
    samples: &[Sample],
    frames: &[Frame],
    geometry: &ImageGeometry,
    topology: Topology,
) -> DatasetResult<Batch> {
    let [h, w, d] = geometry.frame_shape();
    let mut images = Vec::with_capacity(samples.len() * h * w * d);
    for (sample, frame) in samples.iter().zip(frames) {
        if frame.len() != h * w * d {
            return Err(TubDatasetError::Other(format!(
                "frame for {} has {} values, expected {}",
                sample.key,
                frame.len(),
                h * w * d
            )));
        }
        images.extend_from_slice(&frame.pixels);
    }
    let images = HostTensor::new(images, vec![samples.len(), h, w, d]);

    let inertial = if topology.inertial_input {
        Some(stack_rows(
            samples
                .iter()
                .map(|s| s.inertial.as_ref().map(|v| &v[..]).unwrap_or(&[])),
            "inertial",
        )?)
    } else {
        None
    };
    let behavior = if topology.behavior_input {
        Some(stack_rows(
            samples
                .iter()
                .map(|s| s.behavior.as_deref().unwrap_or(&[])),
            "behavior",
        )?)
    } else {
        None
    };

    let controls = control_targets(samples, topology)?;
    let targets = if topology.image_output {
        let side = RECONSTRUCTION_SIDE as usize;
        let mut recon = Vec::with_capacity(samples.len() * side * side);
        for frame in frames {
            recon.extend(reconstruction_target(frame));
        }
        let image = HostTensor::new(recon, vec![samples.len(), side, side, 1]);
        match controls {
            Targets::Split { steering, throttle } => Targets::Reconstruction {
                image,
                steering,
                throttle,
            },
            Targets::Paired(pair) => {
                let sw = samples.first().map(|s| s.steering.width()).unwrap_or(1);
                let tw = pair.row_len().saturating_sub(sw);
                let (mut st, mut th) = (Vec::new(), Vec::new());
                for i in 0..pair.batch() {
                    let row = pair.row(i);
                    st.extend_from_slice(&row[..sw]);
                    th.extend_from_slice(&row[sw..]);
                }
                Targets::Reconstruction {
                    image,
                    steering: HostTensor::new(st, vec![samples.len(), sw]),
                    throttle: HostTensor::new(th, vec![samples.len(), tw]),
                }
            }
            other => other,
        }
    } else {
        controls
    };

    Ok(Batch {
        images,
        inertial,
        behavior,
        history: None,
        targets,
    })
}
