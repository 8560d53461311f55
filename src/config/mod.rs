use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Static description of one member cluster of the federation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterSpec {
    pub name: String,
    /// CPU capacity in cores
    pub cpu_capacity: f64,
    /// Whether the cluster offers GPU acceleration
    #[serde(default)]
    pub acceleration: bool,
}

impl ClusterSpec {
    pub fn acceleration_flag(&self) -> i32 {
        self.acceleration as i32
    }
}

/// Resource intent and scaling coefficients for one service.
///
/// `alpha` and `beta` are the linear-fit coefficients of
/// `max sustainable RPS = alpha * replicas + beta`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSpec {
    /// CPU limit per replica, in cores
    pub cpu_limit: f64,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default)]
    pub acceleration: bool,
    /// Initial replica count
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    pub alpha: f64,
    pub beta: f64,
    /// Grafana dashboard for this service
    #[serde(default)]
    pub grafana: Option<String>,
    /// Read the request rate of this other service instead of our own.
    /// Deployment-specific: some frontends have no request counter of their
    /// own and mirror their upstream's arrival rate.
    #[serde(default)]
    pub rate_alias: Option<String>,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            cpu_limit: 1.0,
            memory: default_memory(),
            acceleration: false,
            replicas: default_replicas(),
            max_replicas: default_max_replicas(),
            alpha: 1.0,
            beta: 0.0,
            grafana: None,
            rate_alias: None,
        }
    }
}

impl ServiceSpec {
    pub fn acceleration_flag(&self) -> i32 {
        self.acceleration as i32
    }

    /// Resource intent as stored on the service record and surfaced by the API.
    pub fn resources(&self) -> serde_json::Value {
        serde_json::json!({
            "cpu": self.cpu_limit.to_string(),
            "memory": self.memory,
            "gpu": self.acceleration as i32,
        })
    }
}

/// The cluster/service topology the solvers run against.
///
/// Cluster order is significant: the first cluster is the anchor the first
/// service of every graph is pinned to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Topology {
    /// Graph-level Grafana dashboard
    #[serde(default)]
    pub graph_grafana: Option<String>,
    pub clusters: Vec<ClusterSpec>,
    pub services: HashMap<String, ServiceSpec>,
}

impl Topology {
    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.iter().map(|c| c.name.clone()).collect()
    }

    pub fn cpu_capacities(&self) -> Vec<f64> {
        self.clusters.iter().map(|c| c.cpu_capacity).collect()
    }

    pub fn acceleration_flags(&self) -> Vec<i32> {
        self.clusters.iter().map(|c| c.acceleration_flag()).collect()
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterSpec> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Spec for a service, falling back to defaults for services the
    /// topology does not know about.
    pub fn service(&self, id: &str) -> ServiceSpec {
        match self.services.get(id) {
            Some(spec) => spec.clone(),
            None => {
                tracing::warn!("No topology entry for service {}, using defaults", id);
                ServiceSpec::default()
            }
        }
    }
}

/// SMO configuration for runtime operations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmoConfig {
    /// Kubeconfig of the federation (Karmada) control plane
    #[serde(default = "default_kubeconfig")]
    pub karmada_kubeconfig: PathBuf,
    #[serde(default = "default_prometheus_host")]
    pub prometheus_host: String,
    /// Seconds between scaling decisions
    #[serde(default = "default_decision_interval")]
    pub decision_interval_secs: u64,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_helm_bin")]
    pub helm_bin: String,
    #[serde(default = "default_hdarctl_bin")]
    pub hdarctl_bin: String,
    #[serde(default = "default_topology")]
    pub topology: Topology,
}

impl Default for SmoConfig {
    fn default() -> Self {
        Self {
            topology: default_topology(),
            karmada_kubeconfig: default_kubeconfig(),
            prometheus_host: default_prometheus_host(),
            decision_interval_secs: default_decision_interval(),
            namespace: default_namespace(),
            bind_address: default_bind_address(),
            port: default_port(),
            helm_bin: default_helm_bin(),
            hdarctl_bin: default_hdarctl_bin(),
        }
    }
}

impl SmoConfig {
    /// Load configuration from the default locations, then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("SMO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("smo")
                    .join("smo.toml")
            });

        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {:?}", path.as_ref()))?;

        let config: SmoConfig =
            toml::from_str(&content).with_context(|| "Failed to parse SMO config")?;

        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize SMO config")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config at {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Environment overrides win over file and default values.
    pub fn apply_env(&mut self) {
        if let Some(kubeconfig) = std::env::var_os("KARMADA_KUBECONFIG") {
            self.karmada_kubeconfig = PathBuf::from(kubeconfig);
        }
        if let Ok(host) = std::env::var("PROMETHEUS_HOST") {
            self.prometheus_host = host;
        }
        if let Ok(bind) = std::env::var("SMO_BIND") {
            self.bind_address = bind;
        }
        if let Ok(port) = std::env::var("SMO_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
    }
}

fn default_memory() -> String {
    "1Gi".to_string()
}

fn default_replicas() -> u32 {
    1
}

fn default_max_replicas() -> u32 {
    3
}

fn default_kubeconfig() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kube")
        .join("karmada-apiserver.config")
}

fn default_prometheus_host() -> String {
    "http://host.docker.internal:30347".to_string()
}

fn default_decision_interval() -> u64 {
    30
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_helm_bin() -> String {
    "helm".to_string()
}

fn default_hdarctl_bin() -> String {
    "hdarctl".to_string()
}

/// The two-cluster testbed topology used by the development deployment.
fn default_topology() -> Topology {
    let mut services = HashMap::new();
    services.insert(
        "image-compression-vo".to_string(),
        ServiceSpec {
            cpu_limit: 0.5,
            alpha: 33.33,
            beta: -16.66,
            rate_alias: Some("noise-reduction".to_string()),
            ..Default::default()
        },
    );
    services.insert(
        "noise-reduction".to_string(),
        ServiceSpec {
            cpu_limit: 1.0,
            alpha: 0.533,
            beta: -0.416,
            ..Default::default()
        },
    );
    services.insert(
        "image-detection".to_string(),
        ServiceSpec {
            cpu_limit: 1.0,
            alpha: 1.67,
            beta: -0.01,
            ..Default::default()
        },
    );

    Topology {
        clusters: vec![
            ClusterSpec {
                name: "netmode-cluster".to_string(),
                cpu_capacity: 4.0,
                acceleration: false,
            },
            ClusterSpec {
                name: "netmode-cluster2".to_string(),
                cpu_capacity: 6.0,
                acceleration: false,
            },
        ],
        services,
        graph_grafana: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_topology_matches_testbed() {
        let topology = default_topology();
        assert_eq!(
            topology.cluster_names(),
            vec!["netmode-cluster", "netmode-cluster2"]
        );
        assert_eq!(topology.cpu_capacities(), vec![4.0, 6.0]);
        assert_eq!(topology.acceleration_flags(), vec![0, 0]);

        let vo = topology.service("image-compression-vo");
        assert_eq!(vo.cpu_limit, 0.5);
        assert_eq!(vo.rate_alias.as_deref(), Some("noise-reduction"));
    }

    #[test]
    fn unknown_service_falls_back_to_defaults() {
        let topology = default_topology();
        let spec = topology.service("no-such-service");
        assert_eq!(spec.cpu_limit, 1.0);
        assert_eq!(spec.max_replicas, 3);
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = SmoConfig::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: SmoConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.port, config.port);
        assert_eq!(parsed.topology.clusters.len(), 2);
    }
}
