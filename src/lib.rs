//! SMO - Service Management Orchestrator
//!
//! This crate provides a control plane that deploys, places, re-places and
//! auto-scales application graphs across a federation of Kubernetes
//! clusters: a MIP-based placement solver, per-cluster replica scaling
//! loops driven by Prometheus request rates, and a Helm-based artifact
//! driver behind an HTTP API.

pub mod api;
pub mod artifact;
pub mod cluster;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod placement;
pub mod scaling;
pub mod store;

pub use config::{ClusterSpec, ServiceSpec, SmoConfig, Topology};
pub use error::{Result, SmoError};

use std::sync::Arc;

use crate::artifact::{ArtifactOps, HelmDriver};
use crate::cluster::{ClusterOps, KubeClusterClient};
use crate::descriptor::GraphDescriptor;
use crate::metrics::{MetricsOps, PrometheusClient};
use crate::orchestrator::Orchestrator;
use crate::store::{GraphRecord, GraphStore};

/// Core SMO API wiring config, store, clients and orchestrator together.
pub struct SmoRuntime {
    config: SmoConfig,
    orchestrator: Arc<Orchestrator>,
}

impl SmoRuntime {
    /// Create a runtime against the real federation, metrics backend and
    /// artifact tooling.
    pub async fn new(config: SmoConfig) -> Result<Self> {
        let cluster = Arc::new(
            KubeClusterClient::from_kubeconfig(&config.karmada_kubeconfig, &config.namespace)
                .await?,
        );
        let metrics = Arc::new(PrometheusClient::new(
            &config.prometheus_host,
            config.decision_interval_secs,
        )?);
        let artifacts = Arc::new(HelmDriver::new(&config));

        Ok(Self::with_components(config, cluster, metrics, artifacts))
    }

    /// Create a runtime with injected collaborators; tests use this to run
    /// the full lifecycle without a cluster.
    pub fn with_components(
        config: SmoConfig,
        cluster: Arc<dyn ClusterOps>,
        metrics: Arc<dyn MetricsOps>,
        artifacts: Arc<dyn ArtifactOps>,
    ) -> Self {
        let store = Arc::new(GraphStore::new());
        let orchestrator = Orchestrator::new(config.clone(), store, cluster, metrics, artifacts);
        Self {
            config,
            orchestrator,
        }
    }

    /// Serve the HTTP API until the process exits.
    pub async fn serve(&self) -> Result<()> {
        api::serve(
            Arc::clone(&self.orchestrator),
            &self.config.bind_address,
            self.config.port,
        )
        .await
    }

    /// Deploy a graph from a parsed descriptor
    pub async fn submit(&self, project: &str, descriptor: GraphDescriptor) -> Result<()> {
        self.orchestrator.submit(project, descriptor).await
    }

    /// Deploy a graph from an OCI-packaged descriptor artifact
    pub async fn submit_artifact(&self, project: &str, artifact_ref: &str) -> Result<()> {
        self.orchestrator.submit_artifact(project, artifact_ref).await
    }

    /// Fetch one graph
    pub async fn fetch(&self, name: &str) -> Option<GraphRecord> {
        self.orchestrator.fetch(name).await
    }

    /// List the graphs of a project
    pub async fn list(&self, project: &str) -> Vec<GraphRecord> {
        self.orchestrator.list(project).await
    }

    /// Trigger re-placement of a graph
    pub async fn replace(&self, name: &str) -> Result<()> {
        self.orchestrator.replace(name).await
    }

    /// Start a stopped graph
    pub async fn start(&self, name: &str) -> Result<()> {
        self.orchestrator.start(name).await
    }

    /// Stop a running graph
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.orchestrator.stop(name).await
    }

    /// Remove a graph and its services
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.orchestrator.remove(name).await
    }

    /// Get the runtime configuration
    pub fn config(&self) -> &SmoConfig {
        &self.config
    }

    /// The orchestrator, for embedding the API routes elsewhere
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }
}
