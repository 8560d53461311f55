//! In-process repository of graphs, services, statuses and placements.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::descriptor::GraphDescriptor;
use crate::error::{Result, SmoError};
use crate::placement::PlacementMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Deployed,
    #[serde(rename = "Not deployed")]
    NotDeployed,
}

/// One service of a stored graph.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    pub name: String,
    pub status: ServiceStatus,
    pub grafana: Option<String>,
    pub cluster_affinity: String,
    pub resources: serde_json::Value,
    pub values_overwrite: serde_json::Value,
    pub artifact_ref: String,
    pub artifact_type: String,
    pub artifact_implementer: String,
}

/// A deployed application graph with its services and the placement the
/// solver last produced for it.
#[derive(Debug, Clone, Serialize)]
pub struct GraphRecord {
    pub name: String,
    pub status: GraphStatus,
    pub project: String,
    pub grafana: Option<String>,
    #[serde(rename = "hdaGraph")]
    pub descriptor: GraphDescriptor,
    pub services: Vec<ServiceRecord>,
    /// Warm start for the next re-placement; not part of the API shape
    #[serde(skip)]
    pub placement: Option<PlacementMatrix>,
}

/// Repository boundary for graphs. Removing a graph removes its services.
#[derive(Debug, Default)]
pub struct GraphStore {
    graphs: RwLock<HashMap<String, GraphRecord>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails when a graph with the same name already exists.
    pub async fn insert(&self, graph: GraphRecord) -> Result<()> {
        let mut graphs = self.graphs.write().await;
        if graphs.contains_key(&graph.name) {
            return Err(SmoError::GraphAlreadyExists { name: graph.name });
        }
        graphs.insert(graph.name.clone(), graph);
        Ok(())
    }

    pub async fn get_by_name(&self, name: &str) -> Option<GraphRecord> {
        self.graphs.read().await.get(name).cloned()
    }

    pub async fn list_by_project(&self, project: &str) -> Vec<GraphRecord> {
        self.graphs
            .read()
            .await
            .values()
            .filter(|graph| graph.project == project)
            .cloned()
            .collect()
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut graphs = self.graphs.write().await;
        graphs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SmoError::GraphNotFound {
                name: name.to_string(),
            })
    }

    pub async fn add_service(&self, graph_name: &str, service: ServiceRecord) -> Result<()> {
        self.with_graph(graph_name, |graph| {
            graph.services.push(service);
            Ok(())
        })
        .await
    }

    pub async fn set_graph_status(&self, name: &str, status: GraphStatus) -> Result<()> {
        self.with_graph(name, |graph| {
            graph.status = status;
            Ok(())
        })
        .await
    }

    pub async fn set_service_status(
        &self,
        graph_name: &str,
        service_name: &str,
        status: ServiceStatus,
    ) -> Result<()> {
        self.with_service(graph_name, service_name, |service| {
            service.status = status;
            Ok(())
        })
        .await
    }

    /// Persist a mutated overrides document for a service.
    pub async fn update_service_values(
        &self,
        graph_name: &str,
        service_name: &str,
        values_overwrite: serde_json::Value,
    ) -> Result<()> {
        self.with_service(graph_name, service_name, move |service| {
            service.values_overwrite = values_overwrite;
            Ok(())
        })
        .await
    }

    pub async fn set_service_affinity(
        &self,
        graph_name: &str,
        service_name: &str,
        cluster: &str,
    ) -> Result<()> {
        self.with_service(graph_name, service_name, |service| {
            service.cluster_affinity = cluster.to_string();
            Ok(())
        })
        .await
    }

    /// Record the placement matrix the solver last produced for a graph.
    pub async fn set_placement(&self, name: &str, placement: PlacementMatrix) -> Result<()> {
        self.with_graph(name, move |graph| {
            graph.placement = Some(placement);
            Ok(())
        })
        .await
    }

    async fn with_graph<F>(&self, name: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut GraphRecord) -> Result<()>,
    {
        let mut graphs = self.graphs.write().await;
        let graph = graphs.get_mut(name).ok_or_else(|| SmoError::GraphNotFound {
            name: name.to_string(),
        })?;
        mutate(graph)
    }

    async fn with_service<F>(&self, graph_name: &str, service_name: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceRecord) -> Result<()>,
    {
        self.with_graph(graph_name, |graph| {
            let service = graph
                .services
                .iter_mut()
                .find(|service| service.name == service_name)
                .ok_or_else(|| {
                    SmoError::Other(anyhow!(
                        "service {} is not part of graph {}",
                        service_name,
                        graph_name
                    ))
                })?;
            mutate(service)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(name: &str, project: &str) -> GraphRecord {
        GraphRecord {
            name: name.to_string(),
            status: GraphStatus::Running,
            project: project.to_string(),
            grafana: None,
            descriptor: GraphDescriptor {
                id: name.to_string(),
                services: Vec::new(),
            },
            services: vec![ServiceRecord {
                name: format!("{name}-frontend"),
                status: ServiceStatus::Deployed,
                grafana: None,
                cluster_affinity: "netmode-cluster".to_string(),
                resources: serde_json::json!({"cpu": "0.5", "memory": "1Gi", "gpu": 0}),
                values_overwrite: serde_json::json!({}),
                artifact_ref: "oci://registry.local/frontend".to_string(),
                artifact_type: "App".to_string(),
                artifact_implementer: "HELM".to_string(),
            }],
            placement: None,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_names() {
        let store = GraphStore::new();
        store.insert(graph("g1", "demo")).await.unwrap();

        let err = store.insert(graph("g1", "demo")).await.unwrap_err();
        assert!(matches!(err, SmoError::GraphAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn delete_cascades_to_services() {
        let store = GraphStore::new();
        store.insert(graph("g1", "demo")).await.unwrap();
        store.delete("g1").await.unwrap();

        assert!(store.get_by_name("g1").await.is_none());
        assert!(store.list_by_project("demo").await.is_empty());
        assert!(matches!(
            store.delete("g1").await,
            Err(SmoError::GraphNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_on_project() {
        let store = GraphStore::new();
        store.insert(graph("g1", "demo")).await.unwrap();
        store.insert(graph("g2", "demo")).await.unwrap();
        store.insert(graph("g3", "other")).await.unwrap();

        let mut names: Vec<String> = store
            .list_by_project("demo")
            .await
            .into_iter()
            .map(|g| g.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn status_and_affinity_updates_stick() {
        let store = GraphStore::new();
        store.insert(graph("g1", "demo")).await.unwrap();

        store
            .set_graph_status("g1", GraphStatus::Stopped)
            .await
            .unwrap();
        store
            .set_service_status("g1", "g1-frontend", ServiceStatus::NotDeployed)
            .await
            .unwrap();
        store
            .set_service_affinity("g1", "g1-frontend", "netmode-cluster2")
            .await
            .unwrap();

        let stored = store.get_by_name("g1").await.unwrap();
        assert_eq!(stored.status, GraphStatus::Stopped);
        assert_eq!(stored.services[0].status, ServiceStatus::NotDeployed);
        assert_eq!(stored.services[0].cluster_affinity, "netmode-cluster2");
    }

    #[tokio::test]
    async fn serializes_to_the_api_shape() {
        let store = GraphStore::new();
        store.insert(graph("g1", "demo")).await.unwrap();

        let stored = store.get_by_name("g1").await.unwrap();
        let value = serde_json::to_value(&stored).unwrap();

        assert_eq!(value["name"], "g1");
        assert_eq!(value["status"], "Running");
        assert_eq!(value["hdaGraph"]["id"], "g1");
        assert_eq!(value["services"][0]["status"], "Deployed");
        assert!(value.get("placement").is_none());
    }

    #[tokio::test]
    async fn not_deployed_serializes_with_a_space() {
        assert_eq!(
            serde_json::to_value(ServiceStatus::NotDeployed).unwrap(),
            serde_json::json!("Not deployed")
        );
    }
}
