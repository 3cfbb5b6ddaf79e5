//! Photometric augmentation applied to training frames.

use crate::types::Frame;
use rand::Rng;

/// Perturbs a decoded frame in place. Implementations must keep pixels in [0, 1].
pub trait Augment: Send + Sync {
    fn augment(&self, frame: &mut Frame, rng: &mut dyn rand::RngCore);

    fn describe(&self) -> String {
        "custom".to_string()
    }
}

/// Random brightness/contrast shift plus optional uniform noise.
#[derive(Debug, Clone)]
pub struct ColorJitter {
    /// Probability of applying brightness/contrast jitter.
    pub jitter_prob: f32,
    /// Max jitter scale for brightness/contrast.
    pub jitter_strength: f32,
    /// Probability of adding per-pixel noise.
    pub noise_prob: f32,
    /// Max absolute noise added.
    pub noise_strength: f32,
}

impl Default for ColorJitter {
    fn default() -> Self {
        Self {
            jitter_prob: 0.5,
            jitter_strength: 0.2,
            noise_prob: 0.2,
            noise_strength: 0.02,
        }
    }
}

impl Augment for ColorJitter {
    fn augment(&self, frame: &mut Frame, rng: &mut dyn rand::RngCore) {
        maybe_jitter(frame, self.jitter_prob, self.jitter_strength, rng);
        maybe_noise(frame, self.noise_prob, self.noise_strength, rng);
    }

    fn describe(&self) -> String {
        format!(
            "color_jitter_p={:.2} strength={:.2} noise_p={:.2} strength={:.3}",
            self.jitter_prob, self.jitter_strength, self.noise_prob, self.noise_strength
        )
    }
}

pub(crate) fn maybe_jitter(
    frame: &mut Frame,
    prob: f32,
    strength: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 || strength <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) >= prob {
        return;
    }
    let bright = 1.0 + rng.random_range(-strength..strength);
    let contrast = 1.0 + rng.random_range(-strength..strength);
    for v in frame.pixels.iter_mut() {
        let shifted = ((*v - 0.5) * contrast + 0.5) * bright;
        *v = shifted.clamp(0.0, 1.0);
    }
}

pub(crate) fn maybe_noise(
    frame: &mut Frame,
    prob: f32,
    strength: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 || strength <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) >= prob {
        return;
    }
    for v in frame.pixels.iter_mut() {
        *v = (*v + rng.random_range(-strength..strength)).clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod aug_tests {
    use super::*;
    use rand::SeedableRng;

    fn flat(v: f32) -> Frame {
        Frame {
            width: 4,
            height: 4,
            depth: 3,
            pixels: vec![v; 48],
        }
    }

    #[test]
    fn jitter_stays_in_unit_range() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let aug = ColorJitter {
            jitter_prob: 1.0,
            jitter_strength: 0.9,
            noise_prob: 1.0,
            noise_strength: 0.5,
        };
        for _ in 0..20 {
            let mut frame = flat(0.95);
            aug.augment(&mut frame, &mut rng);
            assert!(frame.pixels.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn zero_probability_is_identity() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let aug = ColorJitter {
            jitter_prob: 0.0,
            jitter_strength: 0.5,
            noise_prob: 0.0,
            noise_strength: 0.5,
        };
        let mut frame = flat(0.3);
        aug.augment(&mut frame, &mut rng);
        assert_eq!(frame, flat(0.3));
    }
}
