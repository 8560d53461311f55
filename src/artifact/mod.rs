//! Artifact lifecycle against the federation: Helm releases and OCI pulls.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SmoConfig;
use crate::descriptor::DescriptorDocument;
use crate::error::{DescriptorError, Result, SubprocessError};

/// Install, upgrade and remove service artifacts, and pull descriptors out
/// of OCI-packaged bundles.
#[async_trait]
pub trait ArtifactOps: Send + Sync {
    /// Fresh deploy of a release
    async fn install(
        &self,
        name: &str,
        artifact_ref: &str,
        values_overwrite: &serde_json::Value,
    ) -> Result<(), SubprocessError>;

    /// Re-apply with the stored overrides layered on the previous values
    async fn upgrade(
        &self,
        name: &str,
        artifact_ref: &str,
        values_overwrite: &serde_json::Value,
    ) -> Result<(), SubprocessError>;

    /// Tear a release down
    async fn uninstall(&self, name: &str) -> Result<(), SubprocessError>;

    /// Pull an artifact and parse the descriptor document packaged inside
    async fn pull_descriptor(&self, artifact_ref: &str) -> Result<DescriptorDocument>;
}

/// [`ArtifactOps`] shelling out to `helm` and `hdarctl` with the federation
/// kubeconfig.
pub struct HelmDriver {
    helm_bin: String,
    hdarctl_bin: String,
    kubeconfig: PathBuf,
}

impl HelmDriver {
    pub fn new(config: &SmoConfig) -> Self {
        Self {
            helm_bin: config.helm_bin.clone(),
            hdarctl_bin: config.hdarctl_bin.clone(),
            kubeconfig: config.karmada_kubeconfig.clone(),
        }
    }

    /// Run `helm install|upgrade` with the overrides materialized into a
    /// temporary values file. The file lives exactly as long as this call.
    async fn run_helm(
        &self,
        command: &str,
        name: &str,
        artifact_ref: &str,
        values_overwrite: &serde_json::Value,
    ) -> Result<(), SubprocessError> {
        let values_file = tempfile::Builder::new()
            .prefix("smo-values-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| SubprocessError::SpawnFailed {
                command: self.helm_bin.clone(),
                reason: format!("values file: {}", e),
            })?;
        serde_yaml::to_writer(values_file.as_file(), values_overwrite).map_err(|e| {
            SubprocessError::SpawnFailed {
                command: self.helm_bin.clone(),
                reason: format!("values serialization: {}", e),
            }
        })?;

        let mut cmd = Command::new(&self.helm_bin);
        cmd.arg(command)
            .arg(name)
            .arg(artifact_ref)
            .arg("--values")
            .arg(values_file.path())
            .arg("--kubeconfig")
            .arg(&self.kubeconfig);
        if command == "upgrade" {
            cmd.arg("--reuse-values");
        }

        debug!("Running helm {} for release {}", command, name);
        run_checked(cmd, &format!("{} {}", self.helm_bin, command)).await?;
        info!("helm {} completed for release {}", command, name);
        Ok(())
    }
}

#[async_trait]
impl ArtifactOps for HelmDriver {
    async fn install(
        &self,
        name: &str,
        artifact_ref: &str,
        values_overwrite: &serde_json::Value,
    ) -> Result<(), SubprocessError> {
        self.run_helm("install", name, artifact_ref, values_overwrite)
            .await
    }

    async fn upgrade(
        &self,
        name: &str,
        artifact_ref: &str,
        values_overwrite: &serde_json::Value,
    ) -> Result<(), SubprocessError> {
        self.run_helm("upgrade", name, artifact_ref, values_overwrite)
            .await
    }

    async fn uninstall(&self, name: &str) -> Result<(), SubprocessError> {
        let mut cmd = Command::new(&self.helm_bin);
        cmd.arg("uninstall")
            .arg(name)
            .arg("--kubeconfig")
            .arg(&self.kubeconfig);

        run_checked(cmd, &format!("{} uninstall", self.helm_bin)).await?;
        info!("helm uninstall completed for release {}", name);
        Ok(())
    }

    async fn pull_descriptor(&self, artifact_ref: &str) -> Result<DescriptorDocument> {
        let destination = tempfile::Builder::new()
            .prefix("smo-artifact-")
            .tempdir()
            .map_err(|e| SubprocessError::SpawnFailed {
                command: self.hdarctl_bin.clone(),
                reason: e.to_string(),
            })?;

        let mut cmd = Command::new(&self.hdarctl_bin);
        cmd.arg("pull")
            .arg(artifact_ref)
            .arg("--untar")
            .arg("--destination")
            .arg(destination.path());

        run_checked(cmd, &format!("{} pull", self.hdarctl_bin)).await?;

        // The first YAML in the unpacked tree is the descriptor
        for entry in walkdir::WalkDir::new(destination.path())
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            let is_yaml = entry
                .path()
                .extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            debug!("Parsing descriptor candidate {:?}", entry.path());
            let raw = std::fs::read(entry.path())?;
            return DescriptorDocument::parse(&raw);
        }

        warn!("Artifact {} contained no YAML descriptor", artifact_ref);
        Err(DescriptorError::NotFoundInArtifact {
            artifact_ref: artifact_ref.to_string(),
        }
        .into())
    }
}

async fn run_checked(mut cmd: Command, command: &str) -> Result<(), SubprocessError> {
    let output = cmd
        .output()
        .await
        .map_err(|e| SubprocessError::SpawnFailed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(SubprocessError::CommandFailed {
            command: command.to_string(),
            status: output.status.to_string(),
            output: combined,
        });
    }
    Ok(())
}
