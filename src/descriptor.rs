//! Application graph descriptor (hdaGraph) document model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{DescriptorError, Result};

/// Implementer tag whose charts expect placement overrides nested under
/// `voChartOverwrite` instead of at the top level.
pub const WOT_IMPLEMENTER: &str = "WOT";

const CLUSTERS_AFFINITY_KEY: &str = "clustersAffinity";
const SERVICE_IMPORT_CLUSTERS_KEY: &str = "serviceImportClusters";
const VO_CHART_OVERWRITE_KEY: &str = "voChartOverwrite";

/// Top-level descriptor document as submitted over the API or packaged
/// inside an OCI artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDocument {
    #[serde(rename = "hdaGraph")]
    pub hda_graph: GraphDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDescriptor {
    pub id: String,
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    #[serde(default)]
    pub deployment: DeploymentSpec,
    pub artifact: ArtifactSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentSpec {
    #[serde(default)]
    pub intent: DeploymentIntent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentIntent {
    /// Ids of the services this service consumes from
    #[serde(rename = "connectionPoints", default)]
    pub connection_points: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    #[serde(rename = "ociImage")]
    pub oci_image: String,
    #[serde(rename = "ociConfig")]
    pub oci_config: OciConfig,
    #[serde(rename = "valuesOverwrite", default = "empty_object")]
    pub values_overwrite: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciConfig {
    pub implementer: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl DescriptorDocument {
    /// Parse a descriptor from a request body that may be JSON or YAML.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Err(DescriptorError::Missing.into());
        }
        serde_yaml::from_slice(raw)
            .map_err(|e| {
                DescriptorError::InvalidFormat {
                    reason: e.to_string(),
                }
                .into()
            })
    }
}

impl GraphDescriptor {
    pub fn service_ids(&self) -> Vec<String> {
        self.services.iter().map(|s| s.id.clone()).collect()
    }
}

/// Determine, for every service, the clusters it has to be imported to.
///
/// A service `t` must be importable on the cluster of every service `s`
/// that lists `t` among its connection points. One entry is appended per
/// consuming service; duplicates are preserved.
pub fn create_service_imports(
    services: &[ServiceDescriptor],
    service_placement: &HashMap<String, String>,
) -> HashMap<String, Vec<String>> {
    let mut import_clusters: HashMap<String, Vec<String>> = services
        .iter()
        .map(|service| (service.id.clone(), Vec::new()))
        .collect();

    for service in services {
        let connection_points = &service.deployment.intent.connection_points;
        for other in services {
            if connection_points.contains(&other.id) {
                if let Some(cluster) = service_placement.get(&service.id) {
                    import_clusters
                        .entry(other.id.clone())
                        .or_default()
                        .push(cluster.clone());
                }
            }
        }
    }

    import_clusters
}

/// Inject the placement keys into a values overwrite document.
///
/// Charts from the `WOT` implementer read placement from a nested
/// `voChartOverwrite` object; everything else reads it at the top level.
pub fn inject_placement(
    values_overwrite: &mut serde_json::Value,
    implementer: &str,
    cluster_affinity: &str,
    import_clusters: &[String],
) {
    if !values_overwrite.is_object() {
        *values_overwrite = empty_object();
    }

    let placement_dict = if implementer == WOT_IMPLEMENTER {
        values_overwrite.as_object_mut().map(|root| {
            root.entry(VO_CHART_OVERWRITE_KEY.to_string())
                .or_insert_with(empty_object)
        })
    } else {
        Some(values_overwrite)
    };

    if let Some(dict) = placement_dict.and_then(|values| values.as_object_mut()) {
        dict.insert(
            CLUSTERS_AFFINITY_KEY.to_string(),
            serde_json::json!([cluster_affinity]),
        );
        dict.insert(
            SERVICE_IMPORT_CLUSTERS_KEY.to_string(),
            serde_json::json!(import_clusters),
        );
    }
}

/// Read back the affinity previously injected with [`inject_placement`].
pub fn current_affinity(values_overwrite: &serde_json::Value, implementer: &str) -> Option<String> {
    let placement_dict = if implementer == WOT_IMPLEMENTER {
        values_overwrite.get(VO_CHART_OVERWRITE_KEY)?
    } else {
        values_overwrite
    };

    placement_dict
        .get(CLUSTERS_AFFINITY_KEY)?
        .as_array()?
        .first()?
        .as_str()
        .map(str::to_string)
}
