//! Deployment state and scaling against the federation control plane.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec};
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::{debug, error};

use crate::error::ClusterError;

/// Read and mutate deployment replica state on the federation.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Replica count the deployment is configured to run
    async fn get_desired_replicas(&self, name: &str) -> Result<i32, ClusterError>;

    /// Currently available replicas; `None` until the deployment reports a
    /// ready status, callers poll
    async fn get_replicas(&self, name: &str) -> Result<Option<i32>, ClusterError>;

    /// CPU limit of the first container, in cores
    async fn get_cpu_limit(&self, name: &str) -> Result<f64, ClusterError>;

    /// Scale the deployment to the given replica count; idempotent
    async fn scale_deployment(&self, name: &str, replicas: i32) -> Result<(), ClusterError>;
}

/// [`ClusterOps`] over the Karmada control-plane kubeconfig.
pub struct KubeClusterClient {
    deployments: Api<Deployment>,
}

impl KubeClusterClient {
    pub async fn from_kubeconfig(path: &Path, namespace: &str) -> Result<Self, ClusterError> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| ClusterError::Kubeconfig {
            reason: format!("{:?}: {}", path, e),
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::Kubeconfig {
                reason: e.to_string(),
            })?;
        let client = Client::try_from(config).map_err(|e| ClusterError::Kubeconfig {
            reason: e.to_string(),
        })?;

        Ok(Self {
            deployments: Api::namespaced(client, namespace),
        })
    }

    async fn deployment(&self, name: &str) -> Result<Deployment, ClusterError> {
        self.deployments
            .get(name)
            .await
            .map_err(|e| ClusterError::Unavailable {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ClusterOps for KubeClusterClient {
    async fn get_desired_replicas(&self, name: &str) -> Result<i32, ClusterError> {
        let deployment = self.deployment(name).await?;
        Ok(deployment.spec.and_then(|s| s.replicas).unwrap_or(0))
    }

    async fn get_replicas(&self, name: &str) -> Result<Option<i32>, ClusterError> {
        let deployment = match self.deployments.get(name).await {
            Ok(deployment) => deployment,
            // Not created yet counts as not ready, not as an error
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(None),
            Err(e) => {
                return Err(ClusterError::Unavailable {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        Ok(deployment.status.and_then(|s| s.available_replicas))
    }

    async fn get_cpu_limit(&self, name: &str) -> Result<f64, ClusterError> {
        let deployment = self.deployment(name).await?;
        let quantity = deployment
            .spec
            .and_then(|s| s.template.spec)
            .and_then(|pod| pod.containers.into_iter().next())
            .and_then(|container| container.resources)
            .and_then(|resources| resources.limits)
            .and_then(|mut limits| limits.remove("cpu"))
            .ok_or_else(|| ClusterError::InvalidCpuQuantity {
                name: name.to_string(),
                value: String::new(),
            })?;

        parse_cpu_quantity(&quantity.0).ok_or_else(|| ClusterError::InvalidCpuQuantity {
            name: name.to_string(),
            value: quantity.0.clone(),
        })
    }

    async fn scale_deployment(&self, name: &str, replicas: i32) -> Result<(), ClusterError> {
        debug!("Scaling deployment {} to {} replicas", name, replicas);
        let scale = Scale {
            metadata: Default::default(),
            spec: Some(ScaleSpec {
                replicas: Some(replicas),
            }),
            status: None,
        };
        self.deployments
            .patch_scale(name, &PatchParams::default(), &Patch::Merge(&scale))
            .await
            .map_err(|e| {
                error!("Failed to scale deployment {}: {}", name, e);
                ClusterError::ScaleFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            })?;
        Ok(())
    }
}

/// Parse a Kubernetes CPU quantity into cores; `500m` and `0.5` both parse
/// to 0.5.
pub fn parse_cpu_quantity(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix('m') {
        millis.parse::<f64>().ok().map(|m| m * 1e-3)
    } else {
        value.parse::<f64>().ok()
    }
}
