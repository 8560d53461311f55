//! Per-cluster replica scaling: the decision model and the background loop.

use good_lp::{constraint, default_solver, variable, variables, Expression, Solution, SolverModel, Variable};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterOps;
use crate::error::SolverError;
use crate::metrics::MetricsOps;

/// Outcome of one scaling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingDecision {
    /// New replica count per managed service, same order as the input
    Replicas(Vec<u32>),
    /// No feasible scaling on this cluster; re-placement is required
    Escalate,
}

const W_UTIL: f64 = 0.4;
const W_TRANS: f64 = 0.4;

/// Determine the optimal number of replicas for each managed service.
///
/// Minimizes a weighted sum of normalized CPU utilization and transition
/// cost (absolute replica-count change) subject to the cluster CPU bound,
/// the per-service throughput floor `alpha * replicas + beta >= rate`, and
/// the `1..=max_replicas` bounds. Returns [`ScalingDecision::Escalate`]
/// when no assignment satisfies the constraints.
pub fn decide_replicas(
    request_rates: &[f64],
    previous_replicas: &[u32],
    cpu_limits: &[f64],
    acceleration: &[i32],
    alpha: &[f64],
    beta: &[f64],
    cluster_capacity: f64,
    cluster_acceleration: i32,
    maximum_replicas: &[u32],
) -> Result<ScalingDecision, SolverError> {
    let num_services = previous_replicas.len();
    if num_services == 0 {
        return Ok(ScalingDecision::Replicas(Vec::new()));
    }
    if request_rates.len() != num_services
        || cpu_limits.len() != num_services
        || acceleration.len() != num_services
        || alpha.len() != num_services
        || beta.len() != num_services
        || maximum_replicas.len() != num_services
    {
        return Err(SolverError::Backend {
            message: "inconsistent scaling input dimensions".to_string(),
        });
    }

    // GPU admissibility involves no decision variable; an inadmissible
    // service makes the whole model infeasible up front.
    if acceleration.iter().any(|&g| g > cluster_acceleration) {
        return Ok(ScalingDecision::Escalate);
    }

    let mut vars = variables!();
    let replicas: Vec<Variable> = maximum_replicas
        .iter()
        .map(|&max| vars.add(variable().integer().min(1).max(max as f64)))
        .collect();
    // abs_diff >= |previous - replicas|, for the transition cost
    let abs_diff: Vec<Variable> = (0..num_services)
        .map(|_| vars.add(variable().integer().min(0)))
        .collect();

    let max_util_cost = (0..num_services)
        .map(|s| maximum_replicas[s] as f64 * cpu_limits[s])
        .fold(f64::MIN, f64::max);

    let mut objective = Expression::default();
    for s in 0..num_services {
        if max_util_cost > 0.0 {
            objective += W_UTIL * cpu_limits[s] / max_util_cost * replicas[s];
        }
        objective += W_TRANS / maximum_replicas[s] as f64 * abs_diff[s];
    }

    let mut model = vars.minimise(objective).using(default_solver);

    for s in 0..num_services {
        let previous = previous_replicas[s] as f64;
        model = model.with(constraint!(abs_diff[s] >= previous - replicas[s]));
        model = model.with(constraint!(abs_diff[s] >= replicas[s] - previous));
        // throughput floor: the replicas must cover the arrival rate
        model = model.with(constraint!(
            alpha[s] * replicas[s] >= request_rates[s] - beta[s]
        ));
    }

    let mut cluster_load = Expression::default();
    for s in 0..num_services {
        cluster_load += cpu_limits[s] * replicas[s];
    }
    model = model.with(constraint!(cluster_load <= cluster_capacity));

    match model.solve() {
        Ok(solution) => {
            let counts = replicas
                .iter()
                .map(|&r| solution.value(r).round().max(0.0) as u32)
                .collect();
            Ok(ScalingDecision::Replicas(counts))
        }
        Err(good_lp::ResolutionError::Infeasible) => Ok(ScalingDecision::Escalate),
        Err(other) => Err(SolverError::Backend {
            message: other.to_string(),
        }),
    }
}

/// Everything one scaling worker needs to know about its cluster slice.
#[derive(Debug, Clone)]
pub struct ScalingLoopConfig {
    pub graph_name: String,
    pub cluster: String,
    /// Services of the graph placed on this cluster, in topology order
    pub managed_services: Vec<String>,
    /// Metric name to sample per managed service (rate aliases applied)
    pub rate_targets: Vec<String>,
    pub acceleration: Vec<i32>,
    pub alpha: Vec<f64>,
    pub beta: Vec<f64>,
    pub maximum_replicas: Vec<u32>,
    /// CPU limits from the topology, used when live limits are unreadable
    pub fallback_cpu_limits: Vec<f64>,
    pub cluster_capacity: f64,
    pub cluster_acceleration: i32,
    pub decision_interval: Duration,
}

/// Interval between retries while deployments are not ready yet.
const REPLICA_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A running scaling worker for one (graph, cluster) pair.
pub struct ScalingLoopHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ScalingLoopHandle {
    pub fn spawn(
        config: ScalingLoopConfig,
        cluster: Arc<dyn ClusterOps>,
        metrics: Arc<dyn MetricsOps>,
        escalate: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(scaling_loop(config, cluster, metrics, escalate, cancel_rx));
        Self { cancel, task }
    }

    /// Signal cancellation and wait for the worker to observe it.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Scaling worker ended abnormally: {}", e);
            }
        }
    }
}

/// Runs the scaling algorithm periodically until cancelled.
async fn scaling_loop(
    config: ScalingLoopConfig,
    cluster: Arc<dyn ClusterOps>,
    metrics: Arc<dyn MetricsOps>,
    escalate: mpsc::UnboundedSender<String>,
    mut cancel: watch::Receiver<bool>,
) {
    info!(
        "📈 Scaling loop started for graph {} on cluster {} ({} services)",
        config.graph_name,
        config.cluster,
        config.managed_services.len()
    );

    let cpu_limits = read_cpu_limits(&config, cluster.as_ref()).await;

    loop {
        if *cancel.borrow() {
            break;
        }

        // Current replicas; deployments without a ready status yet make us
        // retry on a short interval without burning a tick.
        let current_replicas = match read_replicas(&config, cluster.as_ref()).await {
            Some(replicas) => replicas,
            None => {
                if sleep_or_cancel(&mut cancel, REPLICA_POLL_INTERVAL).await {
                    break;
                }
                continue;
            }
        };

        let mut request_rates = Vec::with_capacity(config.rate_targets.len());
        for target in &config.rate_targets {
            request_rates.push(metrics.get_request_rate(target).await);
        }

        debug!(
            "Scaling tick for {}/{}: rates {:?}, replicas {:?}",
            config.graph_name, config.cluster, request_rates, current_replicas
        );

        match decide_replicas(
            &request_rates,
            &current_replicas,
            &cpu_limits,
            &config.acceleration,
            &config.alpha,
            &config.beta,
            config.cluster_capacity,
            config.cluster_acceleration,
            &config.maximum_replicas,
        ) {
            Ok(ScalingDecision::Replicas(new_replicas)) => {
                apply_replicas(&config, cluster.as_ref(), &current_replicas, &new_replicas).await;
            }
            Ok(ScalingDecision::Escalate) => {
                warn!(
                    "No feasible scaling for graph {} on cluster {}, requesting re-placement",
                    config.graph_name, config.cluster
                );
                let _ = escalate.send(config.graph_name.clone());
            }
            Err(e) => {
                error!(
                    "Scaling decision failed for {}/{}: {}",
                    config.graph_name, config.cluster, e
                );
            }
        }

        if sleep_or_cancel(&mut cancel, config.decision_interval).await {
            break;
        }
    }

    info!(
        "Scaling loop stopped for graph {} on cluster {}",
        config.graph_name, config.cluster
    );
}

async fn read_replicas(config: &ScalingLoopConfig, cluster: &dyn ClusterOps) -> Option<Vec<u32>> {
    let mut replicas = Vec::with_capacity(config.managed_services.len());
    for service in &config.managed_services {
        match cluster.get_replicas(service).await {
            Ok(Some(count)) => replicas.push(count.max(0) as u32),
            Ok(None) => {
                debug!("Deployment {} has no ready replicas yet", service);
                return None;
            }
            Err(e) => {
                warn!("Replica lookup for {} failed, retrying: {}", service, e);
                return None;
            }
        }
    }
    Some(replicas)
}

async fn read_cpu_limits(config: &ScalingLoopConfig, cluster: &dyn ClusterOps) -> Vec<f64> {
    let mut limits = Vec::with_capacity(config.managed_services.len());
    for (index, service) in config.managed_services.iter().enumerate() {
        match cluster.get_cpu_limit(service).await {
            Ok(limit) => limits.push(limit),
            Err(e) => {
                warn!(
                    "CPU limit lookup for {} failed, using topology value: {}",
                    service, e
                );
                limits.push(config.fallback_cpu_limits[index]);
            }
        }
    }
    limits
}

async fn apply_replicas(
    config: &ScalingLoopConfig,
    cluster: &dyn ClusterOps,
    current: &[u32],
    chosen: &[u32],
) {
    for (index, service) in config.managed_services.iter().enumerate() {
        if chosen[index] == current[index] {
            continue;
        }
        info!(
            "Scaling {} on {} from {} to {} replicas",
            service, config.cluster, current[index], chosen[index]
        );
        if let Err(e) = cluster.scale_deployment(service, chosen[index] as i32).await {
            // Mutation failures end the tick; the next tick re-reads state.
            error!("Scaling {} failed: {}", service, e);
            return;
        }
    }
}

/// Sleep for `duration` unless cancelled first; returns true on cancellation.
async fn sleep_or_cancel(cancel: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
