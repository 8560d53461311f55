#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use smo::artifact::ArtifactOps;
use smo::cluster::ClusterOps;
use smo::descriptor::{DescriptorDocument, GraphDescriptor};
use smo::error::{ClusterError, Result, SubprocessError};
use smo::metrics::MetricsOps;
use smo::{SmoConfig, SmoRuntime};

/// In-memory stand-in for the federation control plane.
#[derive(Default)]
pub struct FakeCluster {
    pub replicas: Mutex<HashMap<String, i32>>,
    pub scale_calls: Mutex<Vec<(String, i32)>>,
}

impl FakeCluster {
    pub fn with_replicas(services: &[&str], count: i32) -> Arc<Self> {
        let cluster = Self::default();
        {
            let mut replicas = cluster.replicas.lock().unwrap();
            for service in services {
                replicas.insert(service.to_string(), count);
            }
        }
        Arc::new(cluster)
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn get_desired_replicas(&self, name: &str) -> Result<i32, ClusterError> {
        Ok(*self.replicas.lock().unwrap().get(name).unwrap_or(&1))
    }

    async fn get_replicas(&self, name: &str) -> Result<Option<i32>, ClusterError> {
        Ok(self.replicas.lock().unwrap().get(name).copied())
    }

    async fn get_cpu_limit(&self, name: &str) -> Result<f64, ClusterError> {
        let limit = if name == "image-compression-vo" { 0.5 } else { 1.0 };
        Ok(limit)
    }

    async fn scale_deployment(&self, name: &str, replicas: i32) -> Result<(), ClusterError> {
        self.scale_calls
            .lock()
            .unwrap()
            .push((name.to_string(), replicas));
        self.replicas
            .lock()
            .unwrap()
            .insert(name.to_string(), replicas);
        Ok(())
    }
}

/// Metrics backend returning configured request rates.
#[derive(Default)]
pub struct FakeMetrics {
    pub rates: Mutex<HashMap<String, f64>>,
}

impl FakeMetrics {
    pub fn with_rate(service: &str, rate: f64) -> Arc<Self> {
        let metrics = Self::default();
        metrics
            .rates
            .lock()
            .unwrap()
            .insert(service.to_string(), rate);
        Arc::new(metrics)
    }
}

#[async_trait]
impl MetricsOps for FakeMetrics {
    async fn get_request_rate(&self, name: &str) -> f64 {
        *self.rates.lock().unwrap().get(name).unwrap_or(&0.0)
    }

    async fn get_latency(&self, _name: &str) -> f64 {
        30.0
    }

    async fn get_cpu_utilization(&self, _name: &str) -> f64 {
        0.0
    }
}

/// Records artifact operations instead of shelling out to helm.
#[derive(Default)]
pub struct FakeArtifacts {
    /// (operation, release) pairs in call order
    pub operations: Mutex<Vec<(String, String)>>,
    pub pullable: Mutex<Option<DescriptorDocument>>,
}

impl FakeArtifacts {
    pub fn record(&self, operation: &str, name: &str) {
        self.operations
            .lock()
            .unwrap()
            .push((operation.to_string(), name.to_string()));
    }

    pub fn operations_of(&self, operation: &str) -> Vec<String> {
        self.operations
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl ArtifactOps for FakeArtifacts {
    async fn install(
        &self,
        name: &str,
        _artifact_ref: &str,
        _values_overwrite: &serde_json::Value,
    ) -> Result<(), SubprocessError> {
        self.record("install", name);
        Ok(())
    }

    async fn upgrade(
        &self,
        name: &str,
        _artifact_ref: &str,
        _values_overwrite: &serde_json::Value,
    ) -> Result<(), SubprocessError> {
        self.record("upgrade", name);
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<(), SubprocessError> {
        self.record("uninstall", name);
        Ok(())
    }

    async fn pull_descriptor(&self, artifact_ref: &str) -> Result<DescriptorDocument> {
        self.pullable.lock().unwrap().clone().ok_or_else(|| {
            SubprocessError::CommandFailed {
                command: "hdarctl pull".to_string(),
                status: "exit status: 1".to_string(),
                output: format!("artifact {} not found", artifact_ref),
            }
            .into()
        })
    }
}

pub const GRAPH_NAME: &str = "image-detection-graph";
pub const SERVICES: [&str; 3] = ["image-compression-vo", "noise-reduction", "image-detection"];

pub fn sample_descriptor_yaml() -> &'static str {
    r#"
hdaGraph:
  id: image-detection-graph
  services:
    - id: image-compression-vo
      deployment:
        intent:
          connectionPoints: ["noise-reduction"]
      artifact:
        ociImage: oci://registry.local/image-compression-vo
        ociConfig:
          implementer: WOT
          type: App
        valuesOverwrite:
          voChartOverwrite:
            image:
              tag: v1
    - id: noise-reduction
      deployment:
        intent:
          connectionPoints: ["image-detection"]
      artifact:
        ociImage: oci://registry.local/noise-reduction
        ociConfig:
          implementer: HELM
          type: App
        valuesOverwrite: {}
    - id: image-detection
      deployment:
        intent:
          connectionPoints: []
      artifact:
        ociImage: oci://registry.local/image-detection
        ociConfig:
          implementer: HELM
          type: App
        valuesOverwrite: {}
"#
}

pub fn sample_descriptor() -> GraphDescriptor {
    DescriptorDocument::parse(sample_descriptor_yaml().as_bytes())
        .expect("sample descriptor parses")
        .hda_graph
}

pub struct TestHarness {
    pub runtime: SmoRuntime,
    pub cluster: Arc<FakeCluster>,
    pub metrics: Arc<FakeMetrics>,
    pub artifacts: Arc<FakeArtifacts>,
}

pub fn harness() -> TestHarness {
    harness_with(SmoConfig::default(), Arc::new(FakeMetrics::default()))
}

pub fn harness_with(config: SmoConfig, metrics: Arc<FakeMetrics>) -> TestHarness {
    let cluster = FakeCluster::with_replicas(&SERVICES, 1);
    let artifacts = Arc::new(FakeArtifacts::default());
    let runtime = SmoRuntime::with_components(
        config,
        cluster.clone(),
        metrics.clone(),
        artifacts.clone(),
    );
    TestHarness {
        runtime,
        cluster,
        metrics,
        artifacts,
    }
}
