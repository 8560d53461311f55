mod common;

use common::{harness, harness_with, sample_descriptor, FakeMetrics, GRAPH_NAME, SERVICES};
use pretty_assertions::assert_eq;
use smo::store::{GraphStatus, ServiceStatus};
use smo::{SmoConfig, SmoError};
use std::time::Duration;

#[tokio::test]
async fn submit_places_every_service_and_starts_scaling() {
    let harness = harness();
    harness
        .runtime
        .submit("demo", sample_descriptor())
        .await
        .unwrap();

    let graph = harness.runtime.fetch(GRAPH_NAME).await.unwrap();
    assert_eq!(graph.project, "demo");
    assert_eq!(graph.status, GraphStatus::Running);
    assert_eq!(graph.services.len(), 3);

    // With the testbed defaults everything fits the anchor cluster
    for service in &graph.services {
        assert_eq!(service.cluster_affinity, "netmode-cluster");
        assert_eq!(service.status, ServiceStatus::Deployed);
    }

    // WOT charts carry placement under voChartOverwrite, the rest on top
    let vo = &graph.services[0];
    assert_eq!(
        vo.values_overwrite["voChartOverwrite"]["clustersAffinity"],
        serde_json::json!(["netmode-cluster"])
    );
    assert_eq!(
        vo.values_overwrite["voChartOverwrite"]["image"]["tag"],
        "v1"
    );
    let noise_reduction = &graph.services[1];
    assert_eq!(
        noise_reduction.values_overwrite["clustersAffinity"],
        serde_json::json!(["netmode-cluster"])
    );
    // image-compression-vo consumes noise-reduction, so noise-reduction is
    // imported where image-compression-vo runs
    assert_eq!(
        noise_reduction.values_overwrite["serviceImportClusters"],
        serde_json::json!(["netmode-cluster"])
    );

    assert_eq!(harness.artifacts.operations_of("install"), SERVICES.to_vec());

    let loops = harness.runtime.orchestrator().active_scaling_loops().await;
    assert_eq!(
        loops,
        vec![(GRAPH_NAME.to_string(), "netmode-cluster".to_string())]
    );
}

#[tokio::test]
async fn submitting_the_same_graph_twice_is_a_conflict() {
    let harness = harness();
    harness
        .runtime
        .submit("demo", sample_descriptor())
        .await
        .unwrap();

    let err = harness
        .runtime
        .submit("demo", sample_descriptor())
        .await
        .unwrap_err();
    assert!(matches!(err, SmoError::GraphAlreadyExists { .. }));
}

#[tokio::test]
async fn stop_then_start_returns_services_to_their_clusters() {
    let harness = harness();
    harness
        .runtime
        .submit("demo", sample_descriptor())
        .await
        .unwrap();
    let before = harness.runtime.fetch(GRAPH_NAME).await.unwrap();

    harness.runtime.stop(GRAPH_NAME).await.unwrap();
    let stopped = harness.runtime.fetch(GRAPH_NAME).await.unwrap();
    assert_eq!(stopped.status, GraphStatus::Stopped);
    for service in &stopped.services {
        assert_eq!(service.status, ServiceStatus::NotDeployed);
    }
    assert!(harness
        .runtime
        .orchestrator()
        .active_scaling_loops()
        .await
        .is_empty());
    assert_eq!(
        harness.artifacts.operations_of("uninstall"),
        SERVICES.to_vec()
    );

    harness.runtime.start(GRAPH_NAME).await.unwrap();
    let started = harness.runtime.fetch(GRAPH_NAME).await.unwrap();
    assert_eq!(started.status, GraphStatus::Running);
    for (service, original) in started.services.iter().zip(&before.services) {
        assert_eq!(service.status, ServiceStatus::Deployed);
        assert_eq!(service.cluster_affinity, original.cluster_affinity);
    }
}

#[tokio::test]
async fn lifecycle_conflicts_are_rejected() {
    let harness = harness();
    harness
        .runtime
        .submit("demo", sample_descriptor())
        .await
        .unwrap();

    assert!(matches!(
        harness.runtime.start(GRAPH_NAME).await.unwrap_err(),
        SmoError::AlreadyRunning { .. }
    ));

    harness.runtime.stop(GRAPH_NAME).await.unwrap();
    assert!(matches!(
        harness.runtime.stop(GRAPH_NAME).await.unwrap_err(),
        SmoError::AlreadyStopped { .. }
    ));

    assert!(matches!(
        harness.runtime.start("missing").await.unwrap_err(),
        SmoError::GraphNotFound { .. }
    ));
}

#[tokio::test]
async fn remove_deletes_state_and_workers() {
    let harness = harness();
    harness
        .runtime
        .submit("demo", sample_descriptor())
        .await
        .unwrap();

    harness.runtime.remove(GRAPH_NAME).await.unwrap();

    assert!(harness.runtime.fetch(GRAPH_NAME).await.is_none());
    assert!(harness.runtime.list("demo").await.is_empty());
    assert!(harness
        .runtime
        .orchestrator()
        .active_scaling_loops()
        .await
        .is_empty());
    assert_eq!(
        harness.artifacts.operations_of("uninstall"),
        SERVICES.to_vec()
    );

    assert!(matches!(
        harness.runtime.remove(GRAPH_NAME).await.unwrap_err(),
        SmoError::GraphNotFound { .. }
    ));
}

#[tokio::test]
async fn replace_moves_at_least_one_service_and_upgrades_it() {
    let harness = harness();
    harness
        .runtime
        .submit("demo", sample_descriptor())
        .await
        .unwrap();
    let before = harness.runtime.fetch(GRAPH_NAME).await.unwrap();

    harness.runtime.replace(GRAPH_NAME).await.unwrap();
    let after = harness.runtime.fetch(GRAPH_NAME).await.unwrap();

    let moved: Vec<String> = after
        .services
        .iter()
        .zip(&before.services)
        .filter(|(now, then)| now.cluster_affinity != then.cluster_affinity)
        .map(|(now, _)| now.name.clone())
        .collect();
    assert!(!moved.is_empty(), "re-placement must move a service");
    // the anchor service is pinned
    assert_eq!(after.services[0].cluster_affinity, "netmode-cluster");

    // every moved service was upgraded with refreshed overrides
    let mut upgraded = harness.artifacts.operations_of("upgrade");
    upgraded.sort();
    let mut expected = moved.clone();
    expected.sort();
    assert_eq!(upgraded, expected);

    for service in &after.services {
        if moved.contains(&service.name) {
            assert_eq!(service.cluster_affinity, "netmode-cluster2");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn infeasible_scaling_escalates_into_replacement() {
    // A request rate no replica count can cover forces the scaling loop to
    // escalate, which re-places the graph.
    let mut config = SmoConfig::default();
    config.decision_interval_secs = 1;
    let metrics = FakeMetrics::with_rate("noise-reduction", 100_000.0);
    let harness = harness_with(config, metrics);

    harness
        .runtime
        .submit("demo", sample_descriptor())
        .await
        .unwrap();

    let mut replaced = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let graph = harness.runtime.fetch(GRAPH_NAME).await.unwrap();
        if graph
            .services
            .iter()
            .any(|s| s.cluster_affinity == "netmode-cluster2")
        {
            replaced = true;
            break;
        }
    }
    assert!(replaced, "escalation did not trigger a re-placement");
}
