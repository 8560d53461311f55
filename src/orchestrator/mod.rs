//! Graph lifecycle: submit, re-place, start, stop, remove, and the scaling
//! workers that keep deployed graphs sized to their load.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactOps;
use crate::cluster::ClusterOps;
use crate::config::SmoConfig;
use crate::descriptor::{
    create_service_imports, current_affinity, inject_placement, GraphDescriptor,
};
use crate::error::{Result, SmoError};
use crate::metrics::MetricsOps;
use crate::placement::{convert_placement, decide_placement, initial_placement, swap_placement};
use crate::scaling::{ScalingLoopConfig, ScalingLoopHandle};
use crate::store::{GraphRecord, GraphStatus, GraphStore, ServiceRecord, ServiceStatus};

/// Control plane for application graphs across the cluster federation.
///
/// Operations on the same graph are serialized through a per-graph mutex;
/// scaling workers are tracked per (graph, cluster) pair and are always
/// cancelled and awaited before a re-placement touches their graph.
pub struct Orchestrator {
    config: SmoConfig,
    store: Arc<GraphStore>,
    cluster: Arc<dyn ClusterOps>,
    metrics: Arc<dyn MetricsOps>,
    artifacts: Arc<dyn ArtifactOps>,
    scaling_loops: Mutex<HashMap<(String, String), ScalingLoopHandle>>,
    graph_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    escalate_tx: mpsc::UnboundedSender<String>,
}

impl Orchestrator {
    pub fn new(
        config: SmoConfig,
        store: Arc<GraphStore>,
        cluster: Arc<dyn ClusterOps>,
        metrics: Arc<dyn MetricsOps>,
        artifacts: Arc<dyn ArtifactOps>,
    ) -> Arc<Self> {
        let (escalate_tx, escalate_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            config,
            store,
            cluster,
            metrics,
            artifacts,
            scaling_loops: Mutex::new(HashMap::new()),
            graph_locks: Mutex::new(HashMap::new()),
            escalate_tx,
        });

        tokio::spawn(escalation_listener(
            Arc::clone(&orchestrator),
            escalate_rx,
        ));

        orchestrator
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn config(&self) -> &SmoConfig {
        &self.config
    }

    /// Pull a descriptor out of an OCI artifact and submit it.
    pub async fn submit_artifact(&self, project: &str, artifact_ref: &str) -> Result<()> {
        info!("Pulling descriptor from artifact {}", artifact_ref);
        let document = self.artifacts.pull_descriptor(artifact_ref).await?;
        self.submit(project, document.hda_graph).await
    }

    /// Deploy an application graph: solve the initial placement, install
    /// every service with its placement overrides, and launch the scaling
    /// workers.
    pub async fn submit(&self, project: &str, descriptor: GraphDescriptor) -> Result<()> {
        let name = descriptor.id.clone();
        let lock = self.graph_lock(&name).await;
        let _guard = lock.lock().await;

        if self.store.get_by_name(&name).await.is_some() {
            return Err(SmoError::GraphAlreadyExists { name });
        }

        info!("📦 Deploying graph {} for project {}", name, project);
        self.store
            .insert(GraphRecord {
                name: name.clone(),
                status: GraphStatus::Running,
                project: project.to_string(),
                grafana: self.config.topology.graph_grafana.clone(),
                descriptor: descriptor.clone(),
                services: Vec::new(),
                placement: None,
            })
            .await?;

        let inputs = self.placement_inputs(&descriptor);
        let previous = initial_placement(inputs.service_ids.len(), inputs.cluster_names.len());
        let placement = decide_placement(
            &inputs.cluster_capacities,
            &inputs.cluster_acceleration,
            &inputs.cpu_limits,
            &inputs.acceleration,
            &inputs.replicas,
            &previous,
            true,
        )?;
        self.store.set_placement(&name, placement.clone()).await?;

        let service_placement =
            convert_placement(&placement, &inputs.service_ids, &inputs.cluster_names)?;
        let cluster_placement = swap_placement(&service_placement);
        let import_clusters = create_service_imports(&descriptor.services, &service_placement);

        for service in &descriptor.services {
            let cluster = service_placement
                .get(&service.id)
                .cloned()
                .unwrap_or_default();
            let imports = import_clusters.get(&service.id).cloned().unwrap_or_default();

            let mut values_overwrite = service.artifact.values_overwrite.clone();
            inject_placement(
                &mut values_overwrite,
                &service.artifact.oci_config.implementer,
                &cluster,
                &imports,
            );

            let spec = self.config.topology.service(&service.id);
            self.store
                .add_service(
                    &name,
                    ServiceRecord {
                        name: service.id.clone(),
                        status: ServiceStatus::Deployed,
                        grafana: spec.grafana.clone(),
                        cluster_affinity: cluster,
                        resources: spec.resources(),
                        values_overwrite: values_overwrite.clone(),
                        artifact_ref: service.artifact.oci_image.clone(),
                        artifact_type: service.artifact.oci_config.artifact_type.clone(),
                        artifact_implementer: service.artifact.oci_config.implementer.clone(),
                    },
                )
                .await?;

            self.artifacts
                .install(&service.id, &service.artifact.oci_image, &values_overwrite)
                .await?;
        }

        self.spawn_scaling_loops(&name, &cluster_placement).await;
        info!("✅ Graph {} deployed", name);
        Ok(())
    }

    /// Re-run placement over the replica counts currently observed on the
    /// federation, forcing at least one service to move, and upgrade every
    /// service whose affinity changed.
    pub async fn replace(&self, name: &str) -> Result<()> {
        let lock = self.graph_lock(name).await;
        let _guard = lock.lock().await;

        let graph = self
            .store
            .get_by_name(name)
            .await
            .ok_or_else(|| SmoError::GraphNotFound {
                name: name.to_string(),
            })?;

        info!("🔄 Re-placing graph {}", name);
        self.stop_scaling_loops(name).await;

        let inputs = self.placement_inputs(&graph.descriptor);
        let current_replicas = self.sample_replicas(&inputs).await;
        let previous = graph.placement.clone().unwrap_or_else(|| {
            initial_placement(inputs.service_ids.len(), inputs.cluster_names.len())
        });

        let placement = decide_placement(
            &inputs.cluster_capacities,
            &inputs.cluster_acceleration,
            &inputs.cpu_limits,
            &inputs.acceleration,
            &current_replicas,
            &previous,
            false,
        )?;
        self.store.set_placement(name, placement.clone()).await?;

        let service_placement =
            convert_placement(&placement, &inputs.service_ids, &inputs.cluster_names)?;
        let cluster_placement = swap_placement(&service_placement);
        let import_clusters =
            create_service_imports(&graph.descriptor.services, &service_placement);

        for service in &graph.services {
            let Some(target) = service_placement.get(&service.name) else {
                continue;
            };
            let affinity =
                current_affinity(&service.values_overwrite, &service.artifact_implementer)
                    .unwrap_or_else(|| service.cluster_affinity.clone());
            if affinity == *target {
                continue;
            }

            info!(
                "Moving service {} from {} to {}",
                service.name, affinity, target
            );
            let imports = import_clusters
                .get(&service.name)
                .cloned()
                .unwrap_or_default();
            let mut values_overwrite = service.values_overwrite.clone();
            inject_placement(
                &mut values_overwrite,
                &service.artifact_implementer,
                target,
                &imports,
            );

            self.store
                .update_service_values(name, &service.name, values_overwrite.clone())
                .await?;
            self.store
                .set_service_affinity(name, &service.name, target)
                .await?;
            self.artifacts
                .upgrade(&service.name, &service.artifact_ref, &values_overwrite)
                .await?;
        }

        self.spawn_scaling_loops(name, &cluster_placement).await;
        info!("✅ Graph {} re-placed", name);
        Ok(())
    }

    /// Start a stopped graph by re-installing its artifacts.
    pub async fn start(&self, name: &str) -> Result<()> {
        let lock = self.graph_lock(name).await;
        let _guard = lock.lock().await;

        let graph = self
            .store
            .get_by_name(name)
            .await
            .ok_or_else(|| SmoError::GraphNotFound {
                name: name.to_string(),
            })?;
        if graph.status == GraphStatus::Running {
            return Err(SmoError::AlreadyRunning {
                name: name.to_string(),
            });
        }

        info!("▶️  Starting graph {}", name);
        self.store
            .set_graph_status(name, GraphStatus::Running)
            .await?;
        for service in &graph.services {
            self.artifacts
                .install(&service.name, &service.artifact_ref, &service.values_overwrite)
                .await?;
            self.store
                .set_service_status(name, &service.name, ServiceStatus::Deployed)
                .await?;
        }

        Ok(())
    }

    /// Stop a running graph: uninstall its artifacts and cancel its workers.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let lock = self.graph_lock(name).await;
        let _guard = lock.lock().await;

        let graph = self
            .store
            .get_by_name(name)
            .await
            .ok_or_else(|| SmoError::GraphNotFound {
                name: name.to_string(),
            })?;
        if graph.status == GraphStatus::Stopped {
            return Err(SmoError::AlreadyStopped {
                name: name.to_string(),
            });
        }

        info!("⏹️  Stopping graph {}", name);
        self.uninstall_services(&graph).await;
        for service in &graph.services {
            self.store
                .set_service_status(name, &service.name, ServiceStatus::NotDeployed)
                .await?;
        }
        self.stop_scaling_loops(name).await;
        self.store
            .set_graph_status(name, GraphStatus::Stopped)
            .await?;

        Ok(())
    }

    /// Remove a graph entirely: artifacts, workers, stored state.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let lock = self.graph_lock(name).await;
        let _guard = lock.lock().await;

        let graph = self
            .store
            .get_by_name(name)
            .await
            .ok_or_else(|| SmoError::GraphNotFound {
                name: name.to_string(),
            })?;

        info!("🗑️  Removing graph {}", name);
        self.uninstall_services(&graph).await;
        self.stop_scaling_loops(name).await;
        self.store.delete(name).await?;

        let mut locks = self.graph_locks.lock().await;
        locks.remove(name);

        Ok(())
    }

    pub async fn fetch(&self, name: &str) -> Option<GraphRecord> {
        self.store.get_by_name(name).await
    }

    pub async fn list(&self, project: &str) -> Vec<GraphRecord> {
        self.store.list_by_project(project).await
    }

    /// The (graph, cluster) pairs that currently have a scaling worker.
    pub async fn active_scaling_loops(&self) -> Vec<(String, String)> {
        self.scaling_loops.lock().await.keys().cloned().collect()
    }

    async fn graph_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.graph_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn placement_inputs(&self, descriptor: &GraphDescriptor) -> PlacementInputs {
        let topology = &self.config.topology;
        let service_ids = descriptor.service_ids();
        let specs: Vec<_> = service_ids
            .iter()
            .map(|id| topology.service(id))
            .collect();

        PlacementInputs {
            cluster_names: topology.cluster_names(),
            cluster_capacities: topology.cpu_capacities(),
            cluster_acceleration: topology.acceleration_flags(),
            cpu_limits: specs.iter().map(|s| s.cpu_limit).collect(),
            acceleration: specs.iter().map(|s| s.acceleration_flag()).collect(),
            replicas: specs.iter().map(|s| s.replicas).collect(),
            service_ids,
        }
    }

    /// Current replica count per service, preferring live state over the
    /// desired count and falling back to the topology default while a
    /// deployment is unreachable.
    async fn sample_replicas(&self, inputs: &PlacementInputs) -> Vec<u32> {
        let mut replicas = Vec::with_capacity(inputs.service_ids.len());
        for (index, service) in inputs.service_ids.iter().enumerate() {
            let count = match self.cluster.get_replicas(service).await {
                Ok(Some(available)) => available.max(0) as u32,
                Ok(None) => match self.cluster.get_desired_replicas(service).await {
                    Ok(desired) => desired.max(0) as u32,
                    Err(e) => {
                        warn!("Desired replica lookup for {} failed: {}", service, e);
                        inputs.replicas[index]
                    }
                },
                Err(e) => {
                    warn!("Replica lookup for {} failed: {}", service, e);
                    inputs.replicas[index]
                }
            };
            replicas.push(count);
        }
        replicas
    }

    /// Best-effort uninstall of every service artifact of a graph.
    async fn uninstall_services(&self, graph: &GraphRecord) {
        for service in &graph.services {
            if let Err(e) = self.artifacts.uninstall(&service.name).await {
                warn!("Uninstalling {} failed: {}", service.name, e);
            }
        }
    }

    /// Launch one scaling worker per cluster that holds services of the
    /// graph, replacing any worker already registered for the pair.
    async fn spawn_scaling_loops(
        &self,
        graph_name: &str,
        cluster_placement: &HashMap<String, Vec<String>>,
    ) {
        let topology = &self.config.topology;
        let mut loops = self.scaling_loops.lock().await;

        for cluster_spec in &topology.clusters {
            let Some(managed_services) = cluster_placement.get(&cluster_spec.name) else {
                continue;
            };
            if managed_services.is_empty() {
                continue;
            }

            let specs: Vec<_> = managed_services
                .iter()
                .map(|id| topology.service(id))
                .collect();
            let config = ScalingLoopConfig {
                graph_name: graph_name.to_string(),
                cluster: cluster_spec.name.clone(),
                managed_services: managed_services.clone(),
                rate_targets: managed_services
                    .iter()
                    .zip(&specs)
                    .map(|(id, spec)| spec.rate_alias.clone().unwrap_or_else(|| id.clone()))
                    .collect(),
                acceleration: specs.iter().map(|s| s.acceleration_flag()).collect(),
                alpha: specs.iter().map(|s| s.alpha).collect(),
                beta: specs.iter().map(|s| s.beta).collect(),
                maximum_replicas: specs.iter().map(|s| s.max_replicas).collect(),
                fallback_cpu_limits: specs.iter().map(|s| s.cpu_limit).collect(),
                cluster_capacity: cluster_spec.cpu_capacity,
                cluster_acceleration: cluster_spec.acceleration_flag(),
                decision_interval: Duration::from_secs(self.config.decision_interval_secs),
            };

            let key = (graph_name.to_string(), cluster_spec.name.clone());
            if let Some(stale) = loops.remove(&key) {
                debug!("Replacing scaling worker for {:?}", key);
                stale.shutdown().await;
            }
            loops.insert(
                key,
                ScalingLoopHandle::spawn(
                    config,
                    Arc::clone(&self.cluster),
                    Arc::clone(&self.metrics),
                    self.escalate_tx.clone(),
                ),
            );
        }
    }

    /// Cancel every scaling worker of a graph and wait for each to observe
    /// the cancellation.
    async fn stop_scaling_loops(&self, graph_name: &str) {
        let handles: Vec<ScalingLoopHandle> = {
            let mut loops = self.scaling_loops.lock().await;
            let keys: Vec<_> = loops
                .keys()
                .filter(|(graph, _)| graph == graph_name)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| loops.remove(&key))
                .collect()
        };

        join_all(handles.into_iter().map(|handle| handle.shutdown())).await;
    }
}

struct PlacementInputs {
    service_ids: Vec<String>,
    cluster_names: Vec<String>,
    cluster_capacities: Vec<f64>,
    cluster_acceleration: Vec<i32>,
    cpu_limits: Vec<f64>,
    acceleration: Vec<i32>,
    replicas: Vec<u32>,
}

/// Drains escalation requests from the scaling workers and turns each into
/// a re-placement. Worker loops never call back into the orchestrator
/// directly; re-placement cancels them first, so the channel keeps the two
/// from waiting on each other.
async fn escalation_listener(
    orchestrator: Arc<Orchestrator>,
    mut escalations: mpsc::UnboundedReceiver<String>,
) {
    while let Some(graph_name) = escalations.recv().await {
        info!("Escalation received for graph {}", graph_name);
        if let Err(e) = orchestrator.replace(&graph_name).await {
            error!("Escalated re-placement of {} failed: {}", graph_name, e);
        }
    }
}
