//! Best-model checkpointing with an externally triggered reset.

use crate::artifacts::{save_json_and_weights, ArtifactPaths};
use crate::config::TrainConfig;
use crate::error::TrainResult;
use crate::export::BestModelHook;
use crate::pilot::Pilot;
use tracing::{info, warn};

/// Saves the model whenever the monitored loss beats the best seen so far.
///
/// `reset_best` does not act immediately: the next epoch end first forgets the
/// baseline and then compares, so the first loss after a reset always counts as
/// an improvement.
pub struct CheckpointPolicy {
    artifacts: ArtifactPaths,
    best: f32,
    reset_pending: bool,
    hook: Option<Box<dyn BestModelHook>>,
    saves: usize,
}

impl CheckpointPolicy {
    pub fn new(artifacts: ArtifactPaths) -> Self {
        Self {
            artifacts,
            best: f32::INFINITY,
            reset_pending: false,
            hook: None,
            saves: 0,
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn BestModelHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn best(&self) -> f32 {
        self.best
    }

    /// Number of checkpoints written.
    pub fn saves(&self) -> usize {
        self.saves
    }

    pub fn reset_best(&mut self) {
        self.reset_pending = true;
    }

    /// Applies a pending reset, then reports whether `loss` is a new best.
    pub fn observe(&mut self, loss: f32) -> bool {
        if self.reset_pending {
            self.best = f32::INFINITY;
            self.reset_pending = false;
        }
        if loss < self.best {
            self.best = loss;
            return true;
        }
        false
    }

    /// Saves `model` and its architecture and weights sidecars when `loss` is a new
    /// best, then runs the hook. Hook failures are logged and do not interrupt
    /// training.
    pub fn on_epoch_end(
        &mut self,
        epoch: usize,
        loss: f32,
        model: &dyn Pilot,
        config: &TrainConfig,
    ) -> TrainResult<bool> {
        if !self.observe(loss) {
            return Ok(false);
        }
        model.save(&self.artifacts.model)?;
        save_json_and_weights(model, &self.artifacts)?;
        self.saves += 1;
        info!(
            epoch,
            loss,
            path = %self.artifacts.model.display(),
            "saved best model"
        );
        if let Some(hook) = self.hook.as_mut() {
            if let Err(e) = hook.on_best(config, model, &self.artifacts) {
                warn!("best-model hook failed: {e}");
            }
        }
        Ok(true)
    }
}
