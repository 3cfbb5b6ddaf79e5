//! Epoch loop, continuous-mode bookkeeping and best-model checkpointing.

use crate::artifacts::{write_pretty_json, ArtifactPaths};
use crate::checkpoint::CheckpointPolicy;
use crate::config::TrainConfig;
use crate::early_stopping::EarlyStopping;
use crate::error::{TrainError, TrainResult};
use crate::export::BestModelHook;
use crate::kind::{ModelKind, Regime};
use crate::pilot::{EpochMetrics, OptimizerConfig, Pilot};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tub_dataset::{
    build_windows, extract_legacy_archives, ingest_tubs, split_windows, Augment, Batch,
    BatchOptions, ColorJitter, ContinuousConfig, DatasetEvent, IngestOptions, Partition,
    RecordStore, SequenceBatchGen, SharedStore, TubBatchGen,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Compiling,
    Fitting,
    Checkpoint,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EpochBudget,
    EarlyStop,
    Shutdown,
    /// The training generator ended.
    DataExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub history: Vec<EpochMetrics>,
    pub best_loss: f32,
    pub epochs_run: usize,
    pub stop_reason: StopReason,
    pub train_samples: usize,
    pub val_samples: usize,
    pub steps_per_epoch: usize,
    pub val_steps: usize,
}

impl TrainReport {
    /// Lowest validation loss, falling back to training loss for epochs without one.
    pub fn min_val_loss(&self) -> Option<f32> {
        min_monitored(&self.history)
    }
}

/// What to train and where the result goes.
#[derive(Debug, Clone)]
pub struct TrainRequest {
    pub tubs: Vec<PathBuf>,
    pub model_path: PathBuf,
    pub transfer: Option<PathBuf>,
    pub kind: ModelKind,
    pub continuous: bool,
    pub augment: bool,
}

impl TrainRequest {
    pub fn new(tubs: Vec<PathBuf>, model_path: impl Into<PathBuf>, kind: ModelKind) -> Self {
        Self {
            tubs,
            model_path: model_path.into(),
            transfer: None,
            kind,
            continuous: false,
            augment: false,
        }
    }
}

/// Generators and step counts that outlive a single `run`, so pruning can retrain
/// on the same data.
pub(crate) struct Session {
    pub(crate) kind: ModelKind,
    pub(crate) artifacts: ArtifactPaths,
    pub(crate) store: SharedStore,
    train: Box<dyn Iterator<Item = Batch>>,
    val: Box<dyn Iterator<Item = Batch>>,
    steps: usize,
    val_steps: usize,
    continuous: bool,
    batch_size: usize,
    events: Option<Receiver<DatasetEvent>>,
}

impl Session {
    /// Continuous runs size validation from the current store each epoch.
    fn refresh_val_steps(&mut self) {
        if self.continuous {
            self.val_steps = self.store.borrow().count(Partition::Validation) / self.batch_size;
        }
    }

    /// Growth notices since the last call.
    fn drain_growth(&self) -> usize {
        let Some(rx) = &self.events else {
            return 0;
        };
        let mut grew = 0;
        for event in rx.try_iter() {
            match event {
                DatasetEvent::Grew { before, after } => {
                    debug!(before, after, "dataset grew");
                    grew += 1;
                }
                DatasetEvent::Waiting { have, need } => debug!(have, need, "generator waiting"),
                DatasetEvent::Evicted { key } => debug!(key = %key, "sample evicted"),
            }
        }
        grew
    }
}

/// Settings for one run of the epoch loop.
pub(crate) struct EpochPlan<'a> {
    pub(crate) budget: usize,
    pub(crate) early_stop: Option<EarlyStopping>,
    pub(crate) checkpoint: Option<&'a mut CheckpointPolicy>,
    pub(crate) shutdown: &'a AtomicBool,
}

pub(crate) struct LoopOutcome {
    pub(crate) history: Vec<EpochMetrics>,
    pub(crate) stop_reason: StopReason,
}

pub(crate) fn min_monitored(history: &[EpochMetrics]) -> Option<f32> {
    history
        .iter()
        .map(EpochMetrics::monitored)
        .filter(|l| l.is_finite())
        .reduce(f32::min)
}

/// Fits epochs until the budget, early stopping, shutdown or the data runs out.
pub(crate) fn run_epochs<P: Pilot>(
    pilot: &mut P,
    session: &mut Session,
    mut plan: EpochPlan<'_>,
    config: &TrainConfig,
    phase: &mut Phase,
) -> TrainResult<LoopOutcome> {
    let mut history = Vec::new();
    let mut stop_reason = StopReason::EpochBudget;
    for epoch in 0..plan.budget {
        if plan.shutdown.load(Ordering::Relaxed) {
            stop_reason = StopReason::Shutdown;
            break;
        }
        *phase = Phase::Fitting;
        session.refresh_val_steps();
        let metrics = pilot.fit_epoch(
            session.train.as_mut(),
            session.steps,
            session.val.as_mut(),
            session.val_steps,
        )?;
        if metrics.steps == 0 {
            warn!(epoch, "training generator produced no batches");
            stop_reason = StopReason::DataExhausted;
            break;
        }
        history.push(metrics);
        let monitored = metrics.monitored();
        info!(
            epoch,
            loss = metrics.loss,
            val_loss = metrics.val_loss.unwrap_or(f32::NAN),
            steps = metrics.steps,
            "epoch finished"
        );

        *phase = Phase::Checkpoint;
        if let Some(checkpoint) = plan.checkpoint.as_deref_mut() {
            checkpoint.on_epoch_end(epoch, monitored, &*pilot, config)?;
        }
        // Events are read after the checkpoint decision, so a reset applies to
        // the next epoch.
        if session.drain_growth() > 0 {
            if let Some(checkpoint) = plan.checkpoint.as_deref_mut() {
                checkpoint.reset_best();
            }
        }

        if let Some(early) = plan.early_stop.as_mut() {
            if early.observe(monitored) {
                stop_reason = StopReason::EarlyStop;
                break;
            }
        }
    }
    *phase = Phase::Stopped;
    Ok(LoopOutcome {
        history,
        stop_reason,
    })
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

/// Drives a [`Pilot`] through data preparation, fitting and checkpointing.
pub struct TrainingController<P: Pilot> {
    pub(crate) config: TrainConfig,
    pub(crate) pilot: P,
    pub(crate) shutdown: Arc<AtomicBool>,
    hook: Option<Box<dyn BestModelHook>>,
    pub(crate) phase: Phase,
    pub(crate) session: Option<Session>,
}

impl<P: Pilot> TrainingController<P> {
    pub fn new(config: TrainConfig, pilot: P) -> Self {
        Self {
            config,
            pilot,
            shutdown: Arc::new(AtomicBool::new(false)),
            hook: None,
            phase: Phase::Init,
            session: None,
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn BestModelHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Setting the flag stops training before the next epoch.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn pilot(&self) -> &P {
        &self.pilot
    }

    pub fn into_pilot(self) -> P {
        self.pilot
    }

    pub(crate) fn optimizer(&self) -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: self.config.learning_rate,
            decay: self.config.learning_rate_decay,
        }
    }

    pub fn run(&mut self, req: &TrainRequest) -> TrainResult<TrainReport> {
        self.phase = Phase::Init;
        self.config.validate()?;
        let artifacts = ArtifactPaths::from_model_path(&req.model_path)?;
        if req.continuous && req.kind.regime() != Regime::Frames {
            return Err(TrainError::UnsupportedContinuous {
                kind: req.kind.name().to_string(),
            });
        }

        if let Some(transfer) = &req.transfer {
            self.pilot.load(transfer)?;
            info!(path = %transfer.display(), "loaded transfer weights");
            if self.config.freeze_layers {
                let frozen = self
                    .pilot
                    .layer_count()
                    .saturating_sub(self.config.num_last_layers_to_train);
                self.pilot.freeze_leading(frozen);
                info!(frozen, "froze leading layers");
            }
        }

        let converted = extract_legacy_archives(&req.tubs);
        if converted > 0 {
            info!(converted, "unpacked legacy archives");
        }

        let mut rng = seeded_rng(self.config.seed);
        let ingest = IngestOptions {
            categorical: req
                .kind
                .is_categorical()
                .then(|| self.config.categorical_bins()),
            train_fraction: self.config.train_test_split,
        };
        let store = RecordStore::new().shared();
        let added = ingest_tubs(&req.tubs, &mut store.borrow_mut(), &ingest, &mut rng);
        info!(added, tubs = req.tubs.len(), "ingested records");

        let mut session = match req.kind.regime() {
            Regime::Frames => self.frame_session(req, artifacts, store, ingest)?,
            Regime::Sequence(_) => self.sequence_session(req, artifacts, store, &mut rng)?,
        };
        let train_samples = session.store.borrow().count(Partition::Train);
        let val_samples = session.store.borrow().count(Partition::Validation);
        info!(
            kind = req.kind.name(),
            train_samples,
            val_samples,
            steps = session.steps,
            val_steps = session.val_steps,
            "starting training"
        );

        self.phase = Phase::Compiling;
        self.pilot.compile(&self.optimizer())?;

        let mut checkpoint = CheckpointPolicy::new(session.artifacts.clone());
        if let Some(hook) = self.hook.take() {
            checkpoint = checkpoint.with_hook(hook);
        }
        let early_stop = (self.config.use_early_stop && !req.continuous).then(|| {
            EarlyStopping::new(self.config.early_stop_patience, self.config.min_delta)
        });
        let budget = if req.continuous {
            self.config.continuous_max_epochs
        } else {
            self.config.max_epochs
        };
        let steps_per_epoch = session.steps;
        let val_steps = session.val_steps;
        let outcome = run_epochs(
            &mut self.pilot,
            &mut session,
            EpochPlan {
                budget,
                early_stop,
                checkpoint: Some(&mut checkpoint),
                shutdown: &self.shutdown,
            },
            &self.config,
            &mut self.phase,
        )?;

        let report = TrainReport {
            epochs_run: outcome.history.len(),
            best_loss: checkpoint.best(),
            history: outcome.history,
            stop_reason: outcome.stop_reason,
            train_samples,
            val_samples,
            steps_per_epoch,
            val_steps,
        };
        info!(
            epochs = report.epochs_run,
            best_loss = report.best_loss,
            saves = checkpoint.saves(),
            reason = ?report.stop_reason,
            "training stopped"
        );
        if self.config.write_history {
            write_history(&session.artifacts, &report)?;
        }
        self.session = Some(session);
        Ok(report)
    }

    fn batch_options(&self, augment: bool) -> BatchOptions {
        BatchOptions {
            batch_size: self.config.batch_size,
            geometry: self.config.geometry(),
            cache_images: self.config.cache_images,
            augment: augment.then(|| Arc::new(ColorJitter::default()) as Arc<dyn Augment>),
            continuous: None,
            seed: self.config.seed,
            log_every_samples: self.config.log_every(),
        }
    }

    fn frame_session(
        &self,
        req: &TrainRequest,
        artifacts: ArtifactPaths,
        store: SharedStore,
        ingest: IngestOptions,
    ) -> TrainResult<Session> {
        let batch_size = self.config.batch_size;
        let topology = self.pilot.topology();
        let train_count = store.borrow().count(Partition::Train);
        let val_count = store.borrow().count(Partition::Validation);

        let mut train_opts = self.batch_options(req.augment);
        let mut val_opts = self.batch_options(false);
        val_opts.seed = self.config.seed.map(|s| s.wrapping_add(1));

        let (steps, events) = if req.continuous {
            let continuous = ContinuousConfig {
                tubs: req.tubs.clone(),
                ingest,
                min_records: self.config.min_records_to_train,
                poll_interval: self.config.poll_interval(),
            };
            train_opts.continuous = Some(continuous.clone());
            val_opts.continuous = Some(continuous);
            (self.config.continuous_steps_per_epoch, Some(channel()))
        } else {
            (train_count / batch_size, None)
        };
        if steps < 2 {
            return Err(TrainError::InsufficientData {
                samples: train_count,
                batch_size,
                steps,
            });
        }

        let mut train = TubBatchGen::new(store.clone(), Partition::Train, topology, train_opts);
        let val = TubBatchGen::new(store.clone(), Partition::Validation, topology, val_opts);
        let events = match events {
            Some((tx, rx)) => {
                train = train.with_events(tx);
                Some(rx)
            }
            None => None,
        };

        Ok(Session {
            kind: req.kind,
            artifacts,
            store,
            train: Box::new(train),
            val: Box::new(val),
            steps,
            val_steps: val_count / batch_size,
            continuous: req.continuous,
            batch_size,
            events,
        })
    }

    fn sequence_session(
        &self,
        req: &TrainRequest,
        artifacts: ArtifactPaths,
        store: SharedStore,
        rng: &mut StdRng,
    ) -> TrainResult<Session> {
        let Some(seq) = req.kind.sequence_config(&self.config) else {
            return Err(TrainError::Config(format!(
                "{} is not a sequence model",
                req.kind.name()
            )));
        };
        let batch_size = self.config.batch_size;
        let windows = build_windows(&store.borrow(), seq.window_len());
        let (train_windows, val_windows) =
            split_windows(windows, self.config.train_test_split, rng);
        let steps = train_windows.len() / batch_size;
        if steps < 2 {
            return Err(TrainError::InsufficientData {
                samples: train_windows.len(),
                batch_size,
                steps,
            });
        }
        let val_steps = val_windows.len() / batch_size;
        let geometry = self.config.geometry();
        let augment =
            req.augment.then(|| Arc::new(ColorJitter::default()) as Arc<dyn Augment>);

        let train = SequenceBatchGen::new(
            store.clone(),
            train_windows,
            seq,
            batch_size,
            geometry,
            self.config.seed,
        )
        .with_cache(self.config.cache_images)
        .with_augment(augment);
        let val = SequenceBatchGen::new(
            store.clone(),
            val_windows,
            seq,
            batch_size,
            geometry,
            self.config.seed.map(|s| s.wrapping_add(1)),
        )
        .with_cache(self.config.cache_images);

        Ok(Session {
            kind: req.kind,
            artifacts,
            store,
            train: Box::new(train),
            val: Box::new(val),
            steps,
            val_steps,
            continuous: false,
            batch_size,
            events: None,
        })
    }
}

fn write_history(artifacts: &ArtifactPaths, report: &TrainReport) -> TrainResult<()> {
    let loss: Vec<f32> = report.history.iter().map(|m| m.loss).collect();
    let val_loss: Vec<Option<f32>> = report.history.iter().map(|m| m.val_loss).collect();
    write_pretty_json(
        &artifacts.history(),
        &serde_json::json!({
            "loss": loss,
            "val_loss": val_loss,
            "stop_reason": report.stop_reason,
        }),
    )
}
