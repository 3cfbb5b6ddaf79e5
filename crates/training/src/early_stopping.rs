//! Stop training once the monitored loss plateaus.

use tracing::info;

/// Stops when the loss has not improved by more than `min_delta` for `patience`
/// consecutive epochs.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    best_loss: f32,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: f32::INFINITY,
            epochs_without_improvement: 0,
        }
    }

    pub fn reset(&mut self) {
        self.best_loss = f32::INFINITY;
        self.epochs_without_improvement = 0;
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    /// Records one epoch's loss. Returns true when training should stop.
    pub fn observe(&mut self, loss: f32) -> bool {
        if loss < self.best_loss - self.min_delta {
            self.best_loss = loss;
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }
        if self.epochs_without_improvement >= self.patience {
            info!(
                patience = self.patience,
                best_loss = self.best_loss,
                "early stopping: no improvement"
            );
            return true;
        }
        false
    }
}
