//! Iterative conv-channel pruning ranked by average percentage of zeros (APoZ).
//!
//! Each iteration scores every channel on a fixed evaluation subset, removes the
//! highest-scoring ones, retrains, and keeps the result only while the best
//! validation loss stays under the configured ceiling.

use crate::artifacts::ArtifactPaths;
use crate::config::TrainConfig;
use crate::controller::{
    min_monitored, run_epochs, EpochPlan, Phase, StopReason, TrainReport, TrainingController,
};
use crate::early_stopping::EarlyStopping;
use crate::error::{TrainError, TrainResult};
use crate::kind::Regime;
use crate::pilot::{PrunablePilot, PruneJob};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tub_dataset::{EvalFrames, ImageGeometry, RecordStore};

/// Channel count the loop stops at: `total * (1 - percent_target / 100)`, floored.
pub fn target_channels(total: usize, percent_target: f32) -> usize {
    (total as f32 * (1.0 - percent_target / 100.0)).floor().max(0.0) as usize
}

/// Channels removed in one iteration. A fixed share of the initial count, at
/// least one, never crossing `target`.
pub fn channels_per_iteration(
    initial: usize,
    percent: f32,
    current: usize,
    target: usize,
) -> usize {
    let k = ((percent / 100.0) * initial as f32).floor() as usize;
    k.max(1).min(current.saturating_sub(target))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelApoz {
    pub layer: usize,
    pub channel: usize,
    pub apoz: f32,
}

/// Per-channel zero fraction, weighted by batch size across the evaluation
/// batches.
pub fn compute_apoz<P: PrunablePilot + ?Sized>(
    pilot: &P,
    frames: EvalFrames,
) -> TrainResult<Vec<ChannelApoz>> {
    let mut sums: Vec<Vec<f64>> = pilot
        .conv_channels()
        .iter()
        .map(|&c| vec![0.0; c])
        .collect();
    let mut seen = 0usize;
    for batch in frames {
        let weight = batch.batch();
        let fractions = pilot.conv_zero_fractions(&batch)?;
        for (layer, row) in fractions.iter().enumerate() {
            let Some(acc) = sums.get_mut(layer) else {
                continue;
            };
            for (slot, f) in acc.iter_mut().zip(row) {
                *slot += f64::from(*f) * weight as f64;
            }
        }
        seen += weight;
    }
    if seen == 0 {
        return Err(TrainError::EmptyEvaluation);
    }
    Ok(sums
        .into_iter()
        .enumerate()
        .flat_map(|(layer, acc)| {
            acc.into_iter().enumerate().map(move |(channel, sum)| ChannelApoz {
                layer,
                channel,
                apoz: (sum / seen as f64) as f32,
            })
        })
        .collect())
}

/// Picks the `k` channels with the highest APoZ, grouped per layer. Every layer
/// keeps at least one channel.
pub fn plan_removal(scores: &[ChannelApoz], channels: &[usize], k: usize) -> Vec<PruneJob> {
    let mut ranked = scores.to_vec();
    ranked.sort_by(|a, b| {
        b.apoz
            .total_cmp(&a.apoz)
            .then(a.layer.cmp(&b.layer))
            .then(a.channel.cmp(&b.channel))
    });

    let mut remaining = channels.to_vec();
    let mut by_layer: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut taken = 0;
    for score in ranked {
        if taken == k {
            break;
        }
        match remaining.get_mut(score.layer) {
            Some(left) if *left > 1 && score.channel < channels[score.layer] => {
                *left -= 1;
                by_layer.entry(score.layer).or_default().push(score.channel);
                taken += 1;
            }
            _ => {}
        }
    }
    by_layer
        .into_iter()
        .map(|(layer, mut channels)| {
            channels.sort_unstable();
            PruneJob { layer, channels }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PruneSettings {
    pub percent_per_iteration: f32,
    pub percent_target: f32,
    /// Iterations whose best validation loss reaches this value are rejected.
    pub max_val_loss: f32,
    pub eval_fraction: f32,
    pub batch_size: usize,
    pub geometry: ImageGeometry,
}

impl PruneSettings {
    /// The leading `eval_fraction` of the store in key order.
    pub fn eval_frames(&self, store: &RecordStore) -> EvalFrames {
        EvalFrames::new(store, self.eval_fraction, self.batch_size, self.geometry)
    }

    pub fn from_config(cfg: &TrainConfig, max_val_loss: f32) -> Self {
        Self {
            percent_per_iteration: cfg.prune_percent_per_iteration,
            percent_target: cfg.prune_percent_target,
            max_val_loss,
            eval_fraction: cfg.prune_eval_percent_of_dataset,
            batch_size: cfg.batch_size,
            geometry: cfg.geometry(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneStop {
    TargetReached,
    LossBudget,
    NothingToRemove,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneIteration {
    pub channels_before: usize,
    pub channels_after: usize,
    pub val_loss: f32,
    pub accepted: bool,
    /// Where the accepted model was written.
    pub saved: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    pub initial_channels: usize,
    pub target_channels: usize,
    pub iterations: Vec<PruneIteration>,
    pub stop: PruneStop,
}

impl PruneReport {
    /// Channel count of the last accepted model.
    pub fn final_channels(&self) -> usize {
        self.iterations
            .iter()
            .rev()
            .find(|it| it.accepted)
            .map_or(self.initial_channels, |it| it.channels_after)
    }
}

/// The pruning loop. Retraining is supplied by the caller and returns the best
/// validation loss it reached.
pub struct PruningController<'a> {
    settings: PruneSettings,
    artifacts: &'a ArtifactPaths,
    shutdown: Option<&'a AtomicBool>,
}

impl<'a> PruningController<'a> {
    pub fn new(settings: PruneSettings, artifacts: &'a ArtifactPaths) -> Self {
        Self {
            settings,
            artifacts,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, flag: &'a AtomicBool) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// `eval` is re-read from the start on every iteration.
    pub fn run<P, F>(
        &self,
        pilot: &mut P,
        eval: &EvalFrames,
        mut retrain: F,
    ) -> TrainResult<PruneReport>
    where
        P: PrunablePilot,
        F: FnMut(&mut P) -> TrainResult<f32>,
    {
        let initial = pilot.total_channels();
        let target = target_channels(initial, self.settings.percent_target);
        info!(
            initial,
            target,
            max_val_loss = self.settings.max_val_loss,
            eval_frames = eval.sample_count(),
            "pruning conv channels"
        );

        let mut iterations = Vec::new();
        let stop = loop {
            let current = pilot.total_channels();
            if current <= target {
                break PruneStop::TargetReached;
            }
            if self.shutdown.is_some_and(|f| f.load(Ordering::Relaxed)) {
                break PruneStop::Shutdown;
            }

            let k = channels_per_iteration(
                initial,
                self.settings.percent_per_iteration,
                current,
                target,
            );
            let scores = compute_apoz(pilot, eval.clone())?;
            let jobs = plan_removal(&scores, &pilot.conv_channels(), k);
            if jobs.is_empty() {
                break PruneStop::NothingToRemove;
            }
            pilot.delete_channels(&jobs)?;
            let after = pilot.total_channels();

            let val_loss = retrain(pilot)?;
            let accepted = val_loss < self.settings.max_val_loss;
            let saved = if accepted {
                let path = self.artifacts.pruned(after);
                pilot.save(&path)?;
                Some(path)
            } else {
                None
            };
            info!(before = current, after, val_loss, accepted, "pruning iteration");
            iterations.push(PruneIteration {
                channels_before: current,
                channels_after: after,
                val_loss,
                accepted,
                saved,
            });
            if !accepted {
                break PruneStop::LossBudget;
            }
        };

        Ok(PruneReport {
            initial_channels: initial,
            target_channels: target,
            iterations,
            stop,
        })
    }
}

impl<P: PrunablePilot> TrainingController<P> {
    /// Prunes the model trained by the last [`TrainingController::run`], retraining
    /// on the same generators after each removal.
    pub fn prune(&mut self, report: &TrainReport) -> TrainResult<PruneReport> {
        self.config.validate()?;
        let optimizer = self.optimizer();
        let Some(session) = self.session.as_mut() else {
            return Err(TrainError::Config(
                "pruning needs a completed training run".to_string(),
            ));
        };
        if session.kind.regime() != Regime::Frames {
            return Err(TrainError::Config(format!(
                "{} models cannot be pruned",
                session.kind.name()
            )));
        }
        let Some(min_loss) = report.min_val_loss() else {
            return Err(TrainError::Config(
                "no finite loss to derive a pruning ceiling from".to_string(),
            ));
        };
        let max_val_loss = min_loss + self.config.prune_val_loss_degradation_limit;
        let settings = PruneSettings::from_config(&self.config, max_val_loss);

        let artifacts = session.artifacts.clone();
        let config = &self.config;
        let shutdown = &*self.shutdown;
        let phase = &mut self.phase;

        let eval = settings.eval_frames(&session.store.borrow());
        let pruner = PruningController::new(settings, &artifacts).with_shutdown(shutdown);
        pruner.run(&mut self.pilot, &eval, |pilot| {
            *phase = Phase::Compiling;
            pilot.compile(&optimizer)?;
            let outcome = run_epochs(
                pilot,
                session,
                EpochPlan {
                    budget: config.max_epochs,
                    early_stop: Some(EarlyStopping::new(
                        config.early_stop_patience,
                        config.min_delta,
                    )),
                    checkpoint: None,
                    shutdown,
                },
                config,
                phase,
            )?;
            if outcome.stop_reason == StopReason::DataExhausted {
                warn!("retraining ran out of data");
            }
            Ok(min_monitored(&outcome.history).unwrap_or(f32::INFINITY))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_and_step_sizes() {
        assert_eq!(target_channels(100, 20.0), 80);
        assert_eq!(target_channels(248, 75.0), 62);
        assert_eq!(channels_per_iteration(100, 5.0, 100, 80), 5);
        assert_eq!(channels_per_iteration(100, 5.0, 83, 80), 3);
        assert_eq!(channels_per_iteration(10, 1.0, 10, 5), 1);
    }

    #[test]
    fn plan_takes_highest_apoz_and_keeps_one_per_layer() {
        let scores = vec![
            ChannelApoz {
                layer: 0,
                channel: 0,
                apoz: 0.9,
            },
            ChannelApoz {
                layer: 0,
                channel: 1,
                apoz: 0.8,
            },
            ChannelApoz {
                layer: 1,
                channel: 0,
                apoz: 0.1,
            },
            ChannelApoz {
                layer: 1,
                channel: 1,
                apoz: 0.7,
            },
            ChannelApoz {
                layer: 1,
                channel: 2,
                apoz: 0.2,
            },
        ];
        let jobs = plan_removal(&scores, &[2, 3], 3);
        assert_eq!(
            jobs,
            vec![
                PruneJob {
                    layer: 0,
                    channels: vec![0],
                },
                PruneJob {
                    layer: 1,
                    channels: vec![1, 2],
                },
            ]
        );
    }
}
