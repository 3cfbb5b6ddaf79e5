//! [`Pilot`] implementation backed by a burn [`PilotNet`].

use crate::config::TrainConfig;
use crate::error::{TrainError, TrainResult};
use crate::kind::ModelKind;
use crate::pilot::{EpochMetrics, OptimizerConfig, Pilot, PrunablePilot, PruneJob};
use burn::module::{AutodiffModule, Module};
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::activation::{sigmoid, softmax};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor, TensorData};
use models::{HeadActivation, HeadSpec, PilotNet, PilotNetConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use tub_dataset::{Batch, HostTensor, Targets, Topology};

/// Leading bytes of a full checkpoint. Raw weight files carry no header.
const CHECKPOINT_MAGIC: &[u8; 8] = b"TUBPILOT";

type PilotOptimizer<B> = OptimizerAdaptor<Adam, PilotNet<B>, B>;

/// Architecture stored in front of the weights of a full checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointHeader {
    kind: ModelKind,
    network: PilotNetConfig,
}

pub struct BurnPilot<B: AutodiffBackend> {
    kind: ModelKind,
    network: PilotNetConfig,
    net: PilotNet<B>,
    device: B::Device,
    optim: Option<PilotOptimizer<B>>,
    schedule: OptimizerConfig,
    step: usize,
}

impl<B: AutodiffBackend> BurnPilot<B> {
    pub fn new(kind: ModelKind, cfg: &TrainConfig, device: B::Device) -> Self {
        Self::from_network(kind, kind.network_config(cfg), device)
    }

    pub fn from_network(kind: ModelKind, network: PilotNetConfig, device: B::Device) -> Self {
        let net = PilotNet::new(&network, &device);
        Self {
            kind,
            network,
            net,
            device,
            optim: None,
            schedule: OptimizerConfig::default(),
            step: 0,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn network_config(&self) -> &PilotNetConfig {
        &self.network
    }

    pub fn network(&self) -> &PilotNet<B> {
        &self.net
    }

    /// Learning rate for the next step.
    pub fn current_learning_rate(&self) -> f64 {
        self.schedule.learning_rate / (1.0 + self.schedule.decay * self.step as f64)
    }

    /// Raw head outputs after activation, in head order.
    pub fn predict(&self, batch: &Batch) -> TrainResult<Vec<Vec<f32>>> {
        let valid = self.net.valid();
        let outputs = forward_batch(&valid, &self.network.heads, batch, &self.device)?;
        outputs.into_iter().map(tensor_to_vec).collect()
    }

    fn train_step(&mut self, batch: &Batch) -> TrainResult<f32> {
        let lr = self.current_learning_rate();
        let optim = self.optim.as_mut().ok_or(TrainError::NotCompiled)?;
        let loss = batch_loss(&self.net, &self.network.heads, batch, &self.device)?;
        let value = scalar(loss.clone());
        let grads = GradientsParams::from_grads(loss.backward(), &self.net);
        self.net = optim.step(lr, self.net.clone(), grads);
        self.step += 1;
        Ok(value)
    }

    fn record_bytes(&self) -> TrainResult<Vec<u8>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(
            &recorder,
            self.net.clone().into_record(),
            (),
        )
        .map_err(|e| TrainError::Checkpoint(e.to_string()))
    }

    fn load_record_bytes(&mut self, bytes: Vec<u8>) -> TrainResult<()> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::load(
            &recorder,
            bytes,
            &self.device,
        )
        .map_err(|e| TrainError::Checkpoint(e.to_string()))?;
        self.net = self.net.clone().load_record(record);
        Ok(())
    }
}

impl<B: AutodiffBackend> Pilot for BurnPilot<B> {
    fn topology(&self) -> Topology {
        self.kind.topology()
    }

    fn compile(&mut self, optimizer: &OptimizerConfig) -> TrainResult<()> {
        self.schedule = *optimizer;
        self.step = 0;
        self.optim = Some(AdamConfig::new().init());
        Ok(())
    }

    fn fit_epoch(
        &mut self,
        train: &mut dyn Iterator<Item = Batch>,
        steps: usize,
        val: &mut dyn Iterator<Item = Batch>,
        val_steps: usize,
    ) -> TrainResult<EpochMetrics> {
        let mut losses = Vec::with_capacity(steps);
        for batch in train.take(steps) {
            losses.push(self.train_step(&batch)?);
        }

        let valid = self.net.valid();
        let mut val_losses = Vec::with_capacity(val_steps);
        for batch in val.take(val_steps) {
            let loss = batch_loss(&valid, &self.network.heads, &batch, &self.device)?;
            val_losses.push(scalar(loss));
        }
        debug!(
            steps = losses.len(),
            val_steps = val_losses.len(),
            lr = self.current_learning_rate(),
            "epoch fitted"
        );

        Ok(EpochMetrics {
            loss: mean(&losses),
            val_loss: (!val_losses.is_empty()).then(|| mean(&val_losses)),
            steps: losses.len(),
            val_steps: val_losses.len(),
        })
    }

    fn load(&mut self, path: &Path) -> TrainResult<()> {
        let bytes = fs::read(path).map_err(|e| TrainError::io(path, e))?;
        if !bytes.starts_with(CHECKPOINT_MAGIC) {
            return self.load_record_bytes(bytes);
        }
        let (header, weights) = split_header(&bytes[CHECKPOINT_MAGIC.len()..])?;
        if header.network.heads != self.network.heads {
            warn!(
                path = %path.display(),
                from = header.kind.name(),
                into = self.kind.name(),
                "checkpoint heads differ from the requested model"
            );
        }
        if header.network != self.network {
            self.net = PilotNet::new(&header.network, &self.device);
            self.network = header.network;
            self.optim = None;
        }
        self.load_record_bytes(weights.to_vec())
    }

    fn save(&self, path: &Path) -> TrainResult<()> {
        let header = serde_json::to_vec(&CheckpointHeader {
            kind: self.kind,
            network: self.network.clone(),
        })?;
        let weights = self.record_bytes()?;
        let mut out = Vec::with_capacity(CHECKPOINT_MAGIC.len() + 4 + header.len() + weights.len());
        out.extend_from_slice(CHECKPOINT_MAGIC);
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&weights);
        write_bytes(path, &out)
    }

    fn save_weights(&self, path: &Path) -> TrainResult<()> {
        write_bytes(path, &self.record_bytes()?)
    }

    fn architecture(&self) -> serde_json::Value {
        serde_json::json!({
            "class_name": "PilotNet",
            "kind": self.kind,
            "topology": {
                "inertial_input": self.topology().inertial_input,
                "behavior_input": self.topology().behavior_input,
                "image_output": self.topology().image_output,
                "paired_output": self.topology().paired_output,
            },
            "config": self.network,
        })
    }

    fn layer_count(&self) -> usize {
        self.net.layer_count()
    }

    fn freeze_leading(&mut self, count: usize) {
        self.net = self.net.clone().freeze_leading(count);
    }
}

impl<B: AutodiffBackend> PrunablePilot for BurnPilot<B> {
    fn conv_channels(&self) -> Vec<usize> {
        self.net.conv_channels()
    }

    fn conv_zero_fractions(&self, images: &HostTensor) -> TrainResult<Vec<Vec<f32>>> {
        let valid = self.net.valid();
        let x = images_nchw::<B::InnerBackend>(images, &self.device)?;
        valid
            .conv_activations(x)
            .into_iter()
            .map(|act| {
                let [_, channels, _, _] = act.dims();
                let zeros = act
                    .equal_elem(0.0)
                    .float()
                    .mean_dim(0)
                    .mean_dim(2)
                    .mean_dim(3)
                    .reshape([channels]);
                tensor_to_vec(zeros)
            })
            .collect()
    }

    fn delete_channels(&mut self, jobs: &[PruneJob]) -> TrainResult<()> {
        for job in jobs {
            let Some(spec) = self.network.convs.get_mut(job.layer) else {
                return Err(TrainError::Checkpoint(format!(
                    "no conv layer {} to prune",
                    job.layer
                )));
            };
            self.net = self.net.clone().remove_channels(job.layer, &job.channels);
            if let Some(&left) = self.net.conv_channels().get(job.layer) {
                spec.filters = left;
            }
        }
        // Optimizer moments no longer match the parameter shapes.
        self.optim = None;
        Ok(())
    }
}

fn split_header(body: &[u8]) -> TrainResult<(CheckpointHeader, &[u8])> {
    let truncated = || TrainError::Checkpoint("truncated checkpoint header".to_string());
    let (len, rest) = body.split_first_chunk::<4>().ok_or_else(truncated)?;
    let len = u32::from_le_bytes(*len) as usize;
    if rest.len() < len {
        return Err(truncated());
    }
    let (header, weights) = rest.split_at(len);
    Ok((serde_json::from_slice(header)?, weights))
}

fn write_bytes(path: &Path, bytes: &[u8]) -> TrainResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
    }
    fs::write(path, bytes).map_err(|e| TrainError::io(path, e))
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        f32::NAN
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

fn scalar<B: Backend>(loss: Tensor<B, 1>) -> f32 {
    loss.into_scalar().elem::<f32>()
}

fn tensor_to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> TrainResult<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::BatchShape(format!("{e:?}")))
}

/// `[B, H, W, D]` frames or `[B, L, H, W, D]` sequences into `[B, C, H, W]`.
/// Sequence frames are stacked along channels.
fn images_nchw<B: Backend>(images: &HostTensor, device: &B::Device) -> TrainResult<Tensor<B, 4>> {
    match *images.shape.as_slice() {
        [_, _, _, _] => Ok(images.to_burn::<B, 4>(device).permute([0, 3, 1, 2])),
        [b, l, h, w, d] => Ok(images
            .to_burn::<B, 5>(device)
            .permute([0, 1, 4, 2, 3])
            .reshape([b, l * d, h, w])),
        ref other => Err(TrainError::BatchShape(format!(
            "image batch of shape {other:?}"
        ))),
    }
}

fn rows<B: Backend>(t: &HostTensor, device: &B::Device) -> Tensor<B, 2> {
    Tensor::from_data(
        TensorData::new(t.data.clone(), [t.batch(), t.row_len()]),
        device,
    )
}

/// Inertial, behavior and history vectors joined in that order.
fn aux_input<B: Backend>(batch: &Batch, device: &B::Device) -> Option<Tensor<B, 2>> {
    let parts: Vec<_> = [&batch.inertial, &batch.behavior, &batch.history]
        .into_iter()
        .flatten()
        .map(|t| rows::<B>(t, device))
        .collect();
    (!parts.is_empty()).then(|| Tensor::cat(parts, 1))
}

/// Targets in head order: reconstruction first, then controls.
fn target_list(targets: &Targets) -> Vec<&HostTensor> {
    match targets {
        Targets::Paired(t) => vec![t],
        Targets::Split { steering, throttle } => vec![steering, throttle],
        Targets::Reconstruction {
            image,
            steering,
            throttle,
        } => vec![image, steering, throttle],
    }
}

fn activate<B: Backend>(raw: Tensor<B, 2>, activation: HeadActivation) -> Tensor<B, 2> {
    match activation {
        HeadActivation::Linear => raw,
        HeadActivation::Softmax => softmax(raw, 1),
        HeadActivation::Sigmoid => sigmoid(raw),
    }
}

fn forward_batch<B: Backend>(
    net: &PilotNet<B>,
    heads: &[HeadSpec],
    batch: &Batch,
    device: &B::Device,
) -> TrainResult<Vec<Tensor<B, 2>>> {
    let images = images_nchw::<B>(&batch.images, device)?;
    let outputs = net.forward(images, aux_input::<B>(batch, device));
    if outputs.len() != heads.len() {
        return Err(TrainError::BatchShape(format!(
            "network has {} heads, config lists {}",
            outputs.len(),
            heads.len()
        )));
    }
    Ok(outputs
        .into_iter()
        .zip(heads)
        .map(|(raw, head)| activate(raw, head.activation))
        .collect())
}

/// Sum of per-head losses: cross entropy for softmax heads, mean squared error
/// otherwise.
fn batch_loss<B: Backend>(
    net: &PilotNet<B>,
    heads: &[HeadSpec],
    batch: &Batch,
    device: &B::Device,
) -> TrainResult<Tensor<B, 1>> {
    let outputs = forward_batch(net, heads, batch, device)?;
    let targets = target_list(&batch.targets);
    if targets.len() != outputs.len() {
        return Err(TrainError::BatchShape(format!(
            "{} targets for {} heads",
            targets.len(),
            outputs.len()
        )));
    }

    let mse = MseLoss::new();
    let mut total: Option<Tensor<B, 1>> = None;
    for ((pred, head), target) in outputs.into_iter().zip(heads).zip(targets) {
        let target = rows::<B>(target, device);
        if pred.dims() != target.dims() {
            return Err(TrainError::BatchShape(format!(
                "head {} produces {:?}, target is {:?}",
                head.name,
                pred.dims(),
                target.dims()
            )));
        }
        let loss = match head.activation {
            HeadActivation::Softmax => (target * pred.clamp_min(1e-7).log())
                .sum_dim(1)
                .mean()
                .neg(),
            _ => mse.forward(pred, target, Reduction::Mean),
        };
        total = Some(match total {
            Some(sum) => sum + loss,
            None => loss,
        });
    }
    total.ok_or_else(|| TrainError::BatchShape("network has no heads".to_string()))
}
