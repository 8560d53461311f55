//! Service-to-cluster placement decisions.

use anyhow::anyhow;
use good_lp::{constraint, default_solver, variable, variables, Expression, Solution, SolverModel, Variable};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Result, SolverError};

/// Binary N x K matrix; a `1` at `[i][k]` places service `i` on cluster `k`.
pub type PlacementMatrix = Vec<Vec<i32>>;

/// The placement every graph starts from: all services on the anchor cluster.
pub fn initial_placement(num_services: usize, num_clusters: usize) -> PlacementMatrix {
    (0..num_services)
        .map(|_| {
            let mut row = vec![0; num_clusters];
            if !row.is_empty() {
                row[0] = 1;
            }
            row
        })
        .collect()
}

/// Determine the optimal placement of services across clusters.
///
/// Minimizes deployment cost (number of placements) plus re-optimization
/// cost (penalty for moving a service off its previous cluster) subject to:
///
/// 1. every service lands on exactly one cluster,
/// 2. on re-placement (`initial == false`) at least one service other than
///    the anchor moves off its previous cluster,
/// 3. per-cluster CPU capacity over `cpu_limit * replicas`,
/// 4. GPU-requiring services only land on GPU clusters,
/// 5. the co-location hint over consecutive services, linearized with
///    auxiliary binaries (the dependency vector is currently all zeros),
/// 6. the first service is pinned to the first cluster.
///
/// The chosen solution is one of possibly many optima.
pub fn decide_placement(
    cluster_capacities: &[f64],
    cluster_acceleration: &[i32],
    cpu_limits: &[f64],
    acceleration: &[i32],
    replicas: &[u32],
    current_placement: &[Vec<i32>],
    initial: bool,
) -> Result<PlacementMatrix, SolverError> {
    let num_clusters = cluster_capacities.len();
    let num_services = cpu_limits.len();

    if num_services == 0 {
        return Ok(Vec::new());
    }
    if cluster_acceleration.len() != num_clusters
        || acceleration.len() != num_services
        || replicas.len() != num_services
        || current_placement.len() != num_services
        || current_placement.iter().any(|row| row.len() != num_clusters)
    {
        return Err(SolverError::Backend {
            message: "inconsistent placement input dimensions".to_string(),
        });
    }

    let mut vars = variables!();
    let x: Vec<Vec<Variable>> = (0..num_services)
        .map(|_| {
            (0..num_clusters)
                .map(|_| vars.add(variable().binary()))
                .collect()
        })
        .collect();
    // Auxiliaries for the linearized co-location products x[i][k] * x[i-1][k]
    let z: Vec<Vec<Variable>> = (1..num_services)
        .map(|_| {
            (0..num_clusters)
                .map(|_| vars.add(variable().binary()))
                .collect()
        })
        .collect();

    // Per-edge dependency hints between consecutive services; zero until the
    // descriptor grows a field that feeds them.
    let dependencies = vec![0.0; num_services - 1];

    // Deployment cost plus re-optimization cost y * (y - x)
    let mut objective = Expression::default();
    for i in 0..num_services {
        for k in 0..num_clusters {
            let y = current_placement[i][k] as f64;
            objective += 1.0 * x[i][k];
            objective += y * y;
            objective += -y * x[i][k];
        }
    }

    let mut model = vars.minimise(objective).using(default_solver);

    // Exactly one cluster per service
    for i in 0..num_services {
        let mut row_sum = Expression::default();
        for k in 0..num_clusters {
            row_sum += 1.0 * x[i][k];
        }
        model = model.with(constraint!(row_sum == 1.0));
    }

    // Re-placement must move at least one service other than the anchor
    let change_bound = if initial { 0.0 } else { -1.0 };
    let mut change = Expression::default();
    for i in 1..num_services {
        for k in 0..num_clusters {
            let y = current_placement[i][k] as f64;
            change += y * x[i][k];
            change += -y * y;
        }
    }
    model = model.with(constraint!(change <= change_bound));

    // Cluster CPU capacity
    for k in 0..num_clusters {
        let mut load = Expression::default();
        for i in 1..num_services {
            load += cpu_limits[i] * replicas[i] as f64 * x[i][k];
        }
        model = model.with(constraint!(load <= cluster_capacities[k]));
    }

    // GPU admissibility
    for k in 0..num_clusters {
        for i in 1..num_services {
            model = model.with(constraint!(
                acceleration[i] as f64 * x[i][k] <= cluster_acceleration[k] as f64
            ));
        }
    }

    // Co-location hint: sum_k x[i][k] * x[i-1][k] >= d[i-1], with the
    // product replaced by z[i-1][k]
    for i in 1..num_services {
        for k in 0..num_clusters {
            model = model.with(constraint!(z[i - 1][k] <= x[i][k]));
            model = model.with(constraint!(z[i - 1][k] <= x[i - 1][k]));
            model = model.with(constraint!(z[i - 1][k] >= x[i][k] + x[i - 1][k] - 1.0));
        }
        let mut colocated = Expression::default();
        for k in 0..num_clusters {
            colocated += 1.0 * z[i - 1][k];
        }
        model = model.with(constraint!(colocated >= dependencies[i - 1]));
    }

    // The anchor service is pinned to the anchor cluster
    model = model.with(constraint!(x[0][0] == 1.0));

    let solution = model.solve().map_err(|e| match e {
        good_lp::ResolutionError::Infeasible => SolverError::Infeasible {
            model: "placement".to_string(),
        },
        other => SolverError::Backend {
            message: other.to_string(),
        },
    })?;

    let mut placement = vec![vec![0; num_clusters]; num_services];
    for (i, row) in x.iter().enumerate() {
        for (k, &var) in row.iter().enumerate() {
            if solution.value(var) > 0.5 {
                placement[i][k] = 1;
            }
        }
    }
    debug!("Placement decided: {:?}", placement);
    Ok(placement)
}

/// Convert a placement matrix into a service name -> cluster name mapping.
pub fn convert_placement(
    placement: &[Vec<i32>],
    services: &[String],
    clusters: &[String],
) -> Result<HashMap<String, String>> {
    let mut service_placement = HashMap::new();
    for (service_index, cluster_row) in placement.iter().enumerate() {
        let cluster_index = cluster_row
            .iter()
            .position(|&v| v == 1)
            .ok_or_else(|| anyhow!("service {} has no cluster assigned", service_index))?;
        let service_name = services
            .get(service_index)
            .ok_or_else(|| anyhow!("placement row {} has no matching service", service_index))?;
        let cluster_name = clusters
            .get(cluster_index)
            .ok_or_else(|| anyhow!("placement column {} has no matching cluster", cluster_index))?;
        service_placement.insert(service_name.clone(), cluster_name.clone());
    }
    Ok(service_placement)
}

/// Invert a service -> cluster mapping into cluster -> services.
pub fn swap_placement(service_placement: &HashMap<String, String>) -> HashMap<String, Vec<String>> {
    let mut cluster_placement: HashMap<String, Vec<String>> = HashMap::new();
    for (service, cluster) in service_placement {
        cluster_placement
            .entry(cluster.clone())
            .or_default()
            .push(service.clone());
    }
    cluster_placement
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn testbed_placement(initial: bool) -> Result<PlacementMatrix, SolverError> {
        decide_placement(
            &[4.0, 6.0],
            &[0, 0],
            &[0.5, 1.0, 1.0],
            &[0, 0, 0],
            &[1, 1, 1],
            &[vec![1, 0], vec![1, 0], vec![1, 0]],
            initial,
        )
    }

    fn assert_valid(placement: &PlacementMatrix, capacities: &[f64], cpu: &[f64], replicas: &[u32]) {
        // exactly one cluster per service
        for row in placement {
            assert_eq!(row.iter().sum::<i32>(), 1);
        }
        // anchor pin
        assert_eq!(placement[0][0], 1);
        // cluster capacity over the non-anchor services
        for (k, &capacity) in capacities.iter().enumerate() {
            let load: f64 = placement
                .iter()
                .enumerate()
                .skip(1)
                .map(|(i, row)| row[k] as f64 * cpu[i] * replicas[i] as f64)
                .sum();
            assert!(load <= capacity + 1e-9, "cluster {k} over capacity: {load}");
        }
    }

    #[test]
    fn initial_placement_keeps_testbed_defaults() {
        let placement = testbed_placement(true).unwrap();
        assert_eq!(placement, vec![vec![1, 0], vec![1, 0], vec![1, 0]]);
    }

    #[test]
    fn replacement_moves_at_least_one_service() {
        let placement = testbed_placement(false).unwrap();
        assert_valid(&placement, &[4.0, 6.0], &[0.5, 1.0, 1.0], &[1, 1, 1]);

        let moved = placement
            .iter()
            .skip(1)
            .filter(|row| row[0] == 0)
            .count();
        assert!(moved >= 1, "re-placement left every service in place");
    }

    #[test]
    fn forced_change_solutions_stay_integral() {
        // Symmetric costs make the LP relaxation degenerate here: the
        // forced-change constraint can be met by half-moving two services.
        // Branch-and-bound must still return a 0/1 matrix with exactly one
        // cluster per service.
        let current = vec![
            vec![1, 0, 0],
            vec![1, 0, 0],
            vec![1, 0, 0],
            vec![1, 0, 0],
        ];
        let placement = decide_placement(
            &[8.0, 8.0, 8.0],
            &[0, 0, 0],
            &[1.0, 1.0, 1.0, 1.0],
            &[0, 0, 0, 0],
            &[1, 1, 1, 1],
            &current,
            false,
        )
        .unwrap();

        for row in &placement {
            assert!(row.iter().all(|&v| v == 0 || v == 1));
            assert_eq!(row.iter().sum::<i32>(), 1);
        }
        assert_eq!(placement[0], vec![1, 0, 0]);
        let moved = placement.iter().skip(1).filter(|row| row[0] == 0).count();
        assert!(moved >= 1, "re-placement left every service in place");
    }

    #[test]
    fn gpu_services_only_land_on_gpu_clusters() {
        let placement = decide_placement(
            &[4.0, 6.0],
            &[0, 1],
            &[0.5, 1.0, 1.0],
            &[0, 1, 0],
            &[1, 1, 1],
            &[vec![1, 0], vec![1, 0], vec![1, 0]],
            true,
        )
        .unwrap();

        assert_valid(&placement, &[4.0, 6.0], &[0.5, 1.0, 1.0], &[1, 1, 1]);
        assert_eq!(placement[1], vec![0, 1]);
    }

    #[test]
    fn capacity_overflow_is_infeasible() {
        let result = decide_placement(
            &[4.0, 6.0],
            &[0, 0],
            &[0.5, 10.0, 10.0],
            &[0, 0, 0],
            &[1, 1, 1],
            &[vec![1, 0], vec![1, 0], vec![1, 0]],
            true,
        );
        assert!(matches!(result, Err(SolverError::Infeasible { .. })));
    }

    #[test]
    fn replica_counts_weigh_into_capacity() {
        // 3 replicas of one core each exceed the 2.5-core cluster and must
        // spill to the larger one
        let placement = decide_placement(
            &[2.5, 6.0],
            &[0, 0],
            &[0.5, 1.0],
            &[0, 0],
            &[1, 3],
            &[vec![1, 0], vec![1, 0]],
            true,
        )
        .unwrap();

        assert_valid(&placement, &[2.5, 6.0], &[0.5, 1.0], &[1, 3]);
        assert_eq!(placement[1], vec![0, 1]);
    }

    #[test]
    fn converts_matrix_to_service_mapping() {
        let placement = vec![vec![1, 0], vec![1, 0]];
        let services = vec!["service1".to_string(), "service2".to_string()];
        let clusters = vec!["cluster1".to_string(), "cluster2".to_string()];

        let result = convert_placement(&placement, &services, &clusters).unwrap();

        let expected = HashMap::from([
            ("service1".to_string(), "cluster1".to_string()),
            ("service2".to_string(), "cluster1".to_string()),
        ]);
        assert_eq!(result, expected);
    }

    #[test]
    fn convert_rejects_unassigned_rows() {
        let placement = vec![vec![0, 0]];
        let services = vec!["service1".to_string()];
        let clusters = vec!["cluster1".to_string(), "cluster2".to_string()];
        assert!(convert_placement(&placement, &services, &clusters).is_err());
    }

    #[test]
    fn swaps_service_mapping_to_cluster_mapping() {
        let service_placement = HashMap::from([
            ("service1".to_string(), "cluster1".to_string()),
            ("service2".to_string(), "cluster1".to_string()),
        ]);

        let mut result = swap_placement(&service_placement);
        result.get_mut("cluster1").unwrap().sort();

        let expected = HashMap::from([(
            "cluster1".to_string(),
            vec!["service1".to_string(), "service2".to_string()],
        )]);
        assert_eq!(result, expected);
    }

    #[test]
    fn swap_is_the_inverse_of_convert() {
        let placement = vec![vec![1, 0], vec![0, 1], vec![0, 1]];
        let services = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let clusters = vec!["k1".to_string(), "k2".to_string()];

        let service_placement = convert_placement(&placement, &services, &clusters).unwrap();
        let mut cluster_placement = swap_placement(&service_placement);
        for services in cluster_placement.values_mut() {
            services.sort();
        }

        assert_eq!(cluster_placement["k1"], vec!["a"]);
        assert_eq!(cluster_placement["k2"], vec!["b", "c"]);
    }
}
