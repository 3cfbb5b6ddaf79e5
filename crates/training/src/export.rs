//! Actions run whenever a new best model is saved.

use crate::artifacts::ArtifactPaths;
use crate::config::TrainConfig;
use crate::error::TrainResult;
use crate::pilot::Pilot;
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

pub trait BestModelHook {
    fn on_best(
        &mut self,
        config: &TrainConfig,
        model: &dyn Pilot,
        artifacts: &ArtifactPaths,
    ) -> TrainResult<()>;
}

/// `scp` destination on the vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub user: String,
    pub host: String,
    pub root: String,
}

impl RemoteTarget {
    pub fn from_config(cfg: &TrainConfig) -> Self {
        Self {
            user: cfg.pi_username.clone(),
            host: cfg.pi_hostname.clone(),
            root: cfg.pi_donkey_root.clone(),
        }
    }

    /// `user@host:~/<root>/models/`
    pub fn destination(&self) -> String {
        format!("{}@{}:~/{}/models/", self.user, self.host, self.root)
    }

    pub fn copy_command(&self, file: &Path) -> Command {
        let mut cmd = Command::new("scp");
        cmd.arg(file).arg(self.destination());
        cmd
    }
}

/// Copies the model and both sidecars to the vehicle when sending is enabled.
#[derive(Debug, Clone, Default)]
pub struct ExportHook {
    remote: Option<RemoteTarget>,
}

impl ExportHook {
    pub fn from_config(cfg: &TrainConfig) -> Self {
        Self {
            remote: cfg
                .send_best_model_to_pi
                .then(|| RemoteTarget::from_config(cfg)),
        }
    }

    fn send(&self, artifacts: &ArtifactPaths) {
        let Some(remote) = &self.remote else {
            return;
        };
        for file in artifacts.files() {
            match remote.copy_command(file).status() {
                Ok(status) if status.success() => {
                    info!(file = %file.display(), dest = %remote.destination(), "sent model file")
                }
                Ok(status) => warn!(file = %file.display(), "scp exited with {status}"),
                Err(e) => warn!(file = %file.display(), "could not run scp: {e}"),
            }
        }
    }
}

impl BestModelHook for ExportHook {
    fn on_best(
        &mut self,
        _config: &TrainConfig,
        _model: &dyn Pilot,
        artifacts: &ArtifactPaths,
    ) -> TrainResult<()> {
        self.send(artifacts);
        Ok(())
    }
}
