//! Linear binning of continuous controls into one-hot categories.

use serde::{Deserialize, Serialize};

/// Maps a value onto `bins` equal-width buckets spanning `range`, after shifting by
/// `offset`. With the steering defaults (15 bins, offset 1, range 2) the interval
/// [-1, 1] maps onto bins 0..=14 and 0.0 lands in bin 7.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinSpec {
    pub bins: usize,
    pub offset: f32,
    pub range: f32,
}

impl BinSpec {
    pub fn steering(bins: usize) -> Self {
        Self {
            bins,
            offset: 1.0,
            range: 2.0,
        }
    }

    pub fn throttle(bins: usize, range: f32) -> Self {
        Self {
            bins,
            offset: 0.0,
            range,
        }
    }

    fn width(&self) -> f32 {
        self.range / (self.bins as f32 - self.offset)
    }

    /// Bin index for `value`, clamped to `[0, bins - 1]`. Non-finite input maps to 0.
    pub fn index(&self, value: f32) -> usize {
        if self.bins == 0 {
            return 0;
        }
        let b = ((value + self.offset) / self.width()).round();
        if !b.is_finite() || b <= 0.0 {
            return 0;
        }
        (b as usize).min(self.bins - 1)
    }

    pub fn encode(&self, value: f32) -> Vec<f32> {
        let mut out = vec![0.0; self.bins];
        if let Some(slot) = out.get_mut(self.index(value)) {
            *slot = 1.0;
        }
        out
    }
}

/// Binning applied to both controls for categorical models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategoricalBins {
    pub steering: BinSpec,
    pub throttle: BinSpec,
}

impl Default for CategoricalBins {
    fn default() -> Self {
        Self {
            steering: BinSpec::steering(15),
            throttle: BinSpec::throttle(20, 0.5),
        }
    }
}
