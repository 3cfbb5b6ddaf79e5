//! Command-line entry point for the `train` binary.

use crate::config::TrainConfig;
use crate::controller::{TrainRequest, TrainingController};
use crate::export::ExportHook;
use crate::kind::ModelKind;
use crate::{AutodiffTrainBackend, BurnPilot};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tub_dataset::{expand_tub_arg, read_tub_list};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train a steering model from recorded tubs")]
pub struct TrainArgs {
    /// Tub directories; comma-separated lists and `~/` paths are accepted.
    #[arg(long)]
    pub tub: Vec<String>,
    /// Text file listing one tub directory per line.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Output model path, must end in `.bin`.
    #[arg(long)]
    pub model: PathBuf,
    /// Checkpoint to start from.
    #[arg(long)]
    pub transfer: Option<PathBuf>,
    /// Model kind to train.
    #[arg(long = "type", value_enum, default_value_t = ModelKind::Linear)]
    pub kind: ModelKind,
    /// Keep training while new records are written to the tubs.
    #[arg(long)]
    pub continuous: bool,
    /// Apply photometric augmentation to training frames.
    #[arg(long)]
    pub aug: bool,
    /// TOML config (defaults to $TUB_TRAIN_CONFIG, then ./tub-train.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl TrainArgs {
    pub fn tubs(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut tubs: Vec<PathBuf> = self.tub.iter().flat_map(|t| expand_tub_arg(t)).collect();
        if let Some(list) = &self.file {
            tubs.extend(read_tub_list(list)?);
        }
        if tubs.is_empty() {
            anyhow::bail!("no tubs given; pass --tub or --file");
        }
        Ok(tubs)
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let cfg = match &args.config {
        Some(path) => TrainConfig::from_path(path)?,
        None => TrainConfig::load()?,
    };
    cfg.validate()?;
    let tubs = args.tubs()?;

    let request = TrainRequest {
        tubs,
        model_path: args.model.clone(),
        transfer: args.transfer.clone(),
        kind: args.kind,
        continuous: args.continuous,
        augment: args.aug,
    };
    let pilot = BurnPilot::<AutodiffTrainBackend>::new(args.kind, &cfg, Default::default());
    let mut controller = TrainingController::new(cfg.clone(), pilot)
        .with_hook(Box::new(ExportHook::from_config(&cfg)));

    let report = controller.run(&request)?;
    println!(
        "trained {} for {} epochs ({:?}), best loss {:.4}",
        args.kind.name(),
        report.epochs_run,
        report.stop_reason,
        report.best_loss
    );

    if cfg.prune_cnn {
        let pruned = controller.prune(&report)?;
        info!(
            initial = pruned.initial_channels,
            kept = pruned.final_channels(),
            iterations = pruned.iterations.len(),
            stop = ?pruned.stop,
            "pruning finished"
        );
    }
    Ok(())
}
