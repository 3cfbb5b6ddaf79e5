//! Burn steering networks for the tub trainer.
//!
//! `PilotNet` is a convolutional stem followed by one dense layer and any number of
//! linear heads. Auxiliary vectors (inertial readings, behavior state, control
//! history) join the conv features before the dense layer.
//!
//! The module is pure Burn: activations on the heads, losses and optimizers live in
//! the `training` crate. Conv channels can be removed in place for pruning.

use burn::module::{Module, Param};
use burn::nn;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvLayerSpec {
    pub filters: usize,
    pub kernel: usize,
    pub stride: usize,
}

impl ConvLayerSpec {
    pub const fn new(filters: usize, kernel: usize, stride: usize) -> Self {
        Self {
            filters,
            kernel,
            stride,
        }
    }
}

/// The classic five-layer stem for 160x120 frames.
pub fn default_conv_stack() -> Vec<ConvLayerSpec> {
    vec![
        ConvLayerSpec::new(24, 5, 2),
        ConvLayerSpec::new(32, 5, 2),
        ConvLayerSpec::new(64, 5, 2),
        ConvLayerSpec::new(64, 3, 1),
        ConvLayerSpec::new(64, 3, 1),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadActivation {
    Linear,
    Softmax,
    Sigmoid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadSpec {
    pub name: String,
    pub width: usize,
    pub activation: HeadActivation,
}

impl HeadSpec {
    pub fn new(name: &str, width: usize, activation: HeadActivation) -> Self {
        Self {
            name: name.to_string(),
            width,
            activation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PilotNetConfig {
    /// Image depth times frames per sample.
    pub input_channels: usize,
    pub convs: Vec<ConvLayerSpec>,
    pub hidden: usize,
    pub dropout: f64,
    /// Width of the concatenated auxiliary inputs, 0 when there are none.
    pub aux_inputs: usize,
    pub heads: Vec<HeadSpec>,
}

impl Default for PilotNetConfig {
    fn default() -> Self {
        Self {
            input_channels: 3,
            convs: default_conv_stack(),
            hidden: 100,
            dropout: 0.1,
            aux_inputs: 0,
            heads: vec![
                HeadSpec::new("angle", 1, HeadActivation::Linear),
                HeadSpec::new("throttle", 1, HeadActivation::Linear),
            ],
        }
    }
}

#[derive(Debug, Module)]
pub struct PilotNet<B: Backend> {
    convs: Vec<nn::conv::Conv2d<B>>,
    pool: nn::pool::AdaptiveAvgPool2d,
    dense: nn::Linear<B>,
    dropout: nn::Dropout,
    heads: Vec<nn::Linear<B>>,
    aux_inputs: usize,
}

impl<B: Backend> PilotNet<B> {
    pub fn new(cfg: &PilotNetConfig, device: &B::Device) -> Self {
        let mut convs = Vec::with_capacity(cfg.convs.len());
        let mut channels = cfg.input_channels;
        for spec in &cfg.convs {
            convs.push(
                nn::conv::Conv2dConfig::new([channels, spec.filters], [spec.kernel, spec.kernel])
                    .with_stride([spec.stride, spec.stride])
                    .init(device),
            );
            channels = spec.filters;
        }
        let dense = nn::LinearConfig::new(channels + cfg.aux_inputs, cfg.hidden).init(device);
        let heads = cfg
            .heads
            .iter()
            .map(|h| nn::LinearConfig::new(cfg.hidden, h.width).init(device))
            .collect();
        Self {
            convs,
            pool: nn::pool::AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dense,
            dropout: nn::DropoutConfig::new(cfg.dropout).init(),
            heads,
            aux_inputs: cfg.aux_inputs,
        }
    }

    /// `images` is `[B, C, H, W]`; returns one raw `[B, width]` tensor per head.
    pub fn forward(&self, images: Tensor<B, 4>, aux: Option<Tensor<B, 2>>) -> Vec<Tensor<B, 2>> {
        let mut x = images;
        for conv in &self.convs {
            x = relu(conv.forward(x));
        }
        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        let mut features = x.reshape([batch, channels]);
        if let Some(aux) = aux {
            features = Tensor::cat(vec![features, aux], 1);
        }
        let hidden = self.dropout.forward(relu(self.dense.forward(features)));
        self.heads
            .iter()
            .map(|head| head.forward(hidden.clone()))
            .collect()
    }

    /// Post-activation output of every conv layer.
    pub fn conv_activations(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut out = Vec::with_capacity(self.convs.len());
        let mut x = images;
        for conv in &self.convs {
            x = relu(conv.forward(x));
            out.push(x.clone());
        }
        out
    }

    /// Output channels of each conv layer.
    pub fn conv_channels(&self) -> Vec<usize> {
        self.convs.iter().map(|c| c.weight.val().dims()[0]).collect()
    }

    /// Conv layers, the dense layer, then the heads.
    pub fn layer_count(&self) -> usize {
        self.convs.len() + 1 + self.heads.len()
    }

    /// Stops gradient tracking for the first `count` layers.
    pub fn freeze_leading(mut self, count: usize) -> Self {
        let mut remaining = count;
        self.convs = self
            .convs
            .into_iter()
            .map(|conv| {
                if remaining > 0 {
                    remaining -= 1;
                    conv.no_grad()
                } else {
                    conv
                }
            })
            .collect();
        if remaining > 0 {
            remaining -= 1;
            self.dense = self.dense.no_grad();
        }
        self.heads = self
            .heads
            .into_iter()
            .map(|head| {
                if remaining > 0 {
                    remaining -= 1;
                    head.no_grad()
                } else {
                    head
                }
            })
            .collect();
        self
    }

    /// Removes output channels `drop` from conv `layer` and the matching input
    /// slices of whatever consumes it. Unknown indices are ignored.
    pub fn remove_channels(mut self, layer: usize, drop: &[usize]) -> Self {
        let Some(conv) = self.convs.get(layer) else {
            return self;
        };
        let total = conv.weight.val().dims()[0];
        let keep: Vec<i64> = (0..total)
            .filter(|c| !drop.contains(c))
            .map(|c| c as i64)
            .collect();
        if keep.len() == total || keep.is_empty() {
            return self;
        }

        let conv = &mut self.convs[layer];
        conv.weight = select_param(&conv.weight, 0, &keep);
        conv.bias = conv.bias.as_ref().map(|b| select_param(b, 0, &keep));

        if let Some(next) = self.convs.get_mut(layer + 1) {
            next.weight = select_param(&next.weight, 1, &keep);
        } else {
            // Dense rows are conv features first, auxiliary inputs after.
            let mut rows = keep.clone();
            rows.extend((total..total + self.aux_inputs).map(|r| r as i64));
            self.dense.weight = select_param(&self.dense.weight, 0, &rows);
        }
        self
    }
}

fn select_param<B: Backend, const D: usize>(
    param: &Param<Tensor<B, D>>,
    dim: usize,
    keep: &[i64],
) -> Param<Tensor<B, D>> {
    let value = param.val();
    let device = value.device();
    let indices =
        Tensor::<B, 1, Int>::from_data(TensorData::new(keep.to_vec(), [keep.len()]), &device);
    Param::from_tensor(value.select(dim, indices).detach())
}
