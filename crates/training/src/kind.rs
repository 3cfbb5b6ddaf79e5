//! Model kinds and the data regime each one trains on.

use crate::config::TrainConfig;
use clap::ValueEnum;
use models::{HeadActivation, HeadSpec, PilotNetConfig};
use serde::{Deserialize, Serialize};
use tub_dataset::{SequenceConfig, SequenceMode, Topology, RECONSTRUCTION_SIDE};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Two scalar regression heads.
    Linear,
    /// Binned steering and throttle.
    Categorical,
    /// Frame plus six inertial readings, one paired head.
    Imu,
    /// Frame plus behavior state, binned outputs.
    Behavior,
    /// Adds a reconstruction head next to the controls.
    Latent,
    /// Stacked frame sequence, paired head.
    Rnn,
    /// Stacked frame sequence treated as a volume, paired head.
    #[value(name = "3d")]
    #[serde(rename = "3d")]
    ThreeD,
    /// Predicts the next `L` control pairs from `L` frames.
    LookAhead,
}

/// How samples are grouped for a model kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Frames,
    Sequence(SequenceMode),
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Linear => "linear",
            ModelKind::Categorical => "categorical",
            ModelKind::Imu => "imu",
            ModelKind::Behavior => "behavior",
            ModelKind::Latent => "latent",
            ModelKind::Rnn => "rnn",
            ModelKind::ThreeD => "3d",
            ModelKind::LookAhead => "look_ahead",
        }
    }

    pub fn regime(&self) -> Regime {
        match self {
            ModelKind::Rnn | ModelKind::ThreeD => Regime::Sequence(SequenceMode::Plain),
            ModelKind::LookAhead => Regime::Sequence(SequenceMode::LookAhead),
            _ => Regime::Frames,
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, ModelKind::Categorical | ModelKind::Behavior)
    }

    pub fn topology(&self) -> Topology {
        match self {
            ModelKind::Linear | ModelKind::Categorical => Topology::split(),
            ModelKind::Imu => Topology {
                inertial_input: true,
                ..Topology::paired()
            },
            ModelKind::Behavior => Topology {
                behavior_input: true,
                ..Topology::split()
            },
            ModelKind::Latent => Topology {
                image_output: true,
                ..Topology::split()
            },
            ModelKind::Rnn | ModelKind::ThreeD | ModelKind::LookAhead => Topology::paired(),
        }
    }

    pub fn sequence_config(&self, cfg: &TrainConfig) -> Option<SequenceConfig> {
        match self.regime() {
            Regime::Frames => None,
            Regime::Sequence(mode) => Some(SequenceConfig {
                length: cfg.sequence_length,
                mode,
                mask_history: cfg.mask_look_ahead_history,
            }),
        }
    }

    /// Network layout matching this kind's inputs and targets.
    pub fn network_config(&self, cfg: &TrainConfig) -> PilotNetConfig {
        let topology = self.topology();
        let frames = match self.regime() {
            Regime::Frames => 1,
            Regime::Sequence(_) => cfg.sequence_length,
        };
        let (steer_w, throttle_w, act) = if self.is_categorical() {
            (cfg.steering_bins, cfg.throttle_bins, HeadActivation::Softmax)
        } else {
            (1, 1, HeadActivation::Linear)
        };

        let mut aux_inputs = 0;
        if topology.inertial_input {
            aux_inputs += 6;
        }
        if topology.behavior_input {
            aux_inputs += cfg.num_behavior_inputs;
        }
        if *self == ModelKind::LookAhead {
            aux_inputs += 2 * cfg.sequence_length;
        }

        let mut heads = Vec::new();
        if topology.image_output {
            let side = RECONSTRUCTION_SIDE as usize;
            heads.push(HeadSpec::new("reconstruction", side * side, HeadActivation::Sigmoid));
        }
        if topology.paired_output {
            let width = match self {
                ModelKind::LookAhead => 2 * cfg.sequence_length,
                _ => 2,
            };
            heads.push(HeadSpec::new("controls", width, HeadActivation::Linear));
        } else {
            heads.push(HeadSpec::new("angle", steer_w, act));
            heads.push(HeadSpec::new("throttle", throttle_w, act));
        }

        PilotNetConfig {
            input_channels: cfg.image_depth as usize * frames,
            convs: cfg.conv_layers.clone(),
            hidden: cfg.dense_units,
            dropout: cfg.dropout,
            aux_inputs,
            heads,
        }
    }
}
