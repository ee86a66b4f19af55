/// Convergence monitor tests
///
/// Polling secondaries against the primary's metadata count
/// Run with: cargo test --test monitor_tests

use couchshard::{
    ClusterError, ConvergenceMonitor, InMemoryCluster, MemoryProgress, MonitorConfig,
    NodeEndpoint, ProgressEvent, RetryPolicy, metadata_counts, wait_for_convergence,
};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> MonitorConfig {
    MonitorConfig::default()
        .poll_interval(Duration::from_millis(5))
        .retry(RetryPolicy::new(2, Duration::from_millis(1)))
}

fn node(cluster: &InMemoryCluster, name: &str) -> NodeEndpoint {
    NodeEndpoint::new(name, cluster.endpoint(name).unwrap())
}

#[tokio::test]
async fn test_percentages_and_sync_order() {
    let cluster = InMemoryCluster::new(8, 3);
    let primary = node(&cluster, "primary");
    let a = node(&cluster, "a");
    let b = node(&cluster, "b");
    cluster.script_counts(&primary.config, &[1000]);
    cluster.script_counts(&a.config, &[200, 600, 1000]);
    cluster.script_counts(&b.config, &[500, 1000]);
    let progress = MemoryProgress::new();

    let report = wait_for_convergence(
        Arc::new(cluster.clone()),
        &primary,
        &[a, b],
        fast_config(),
        &progress,
    )
    .await
    .unwrap();

    assert_eq!(progress.percents_for("a"), vec![20.0, 60.0, 100.0]);
    assert_eq!(progress.percents_for("b"), vec![50.0, 100.0]);
    assert_eq!(report.target, 1000);
    assert_eq!(report.polls, 3);
    assert_eq!(report.nodes.get("a"), Some(&1000));
    assert_eq!(report.nodes.get("b"), Some(&1000));

    let events = progress.events();
    let synced_at = |name: &str| {
        events
            .iter()
            .position(|e| *e == ProgressEvent::NodeSynced { node: name.to_string() })
            .unwrap()
    };
    assert!(synced_at("b") < synced_at("a"));
    assert_eq!(events.last(), Some(&ProgressEvent::AllSynced));
    assert_eq!(
        events.iter().filter(|e| **e == ProgressEvent::AllSynced).count(),
        1
    );
    assert!(synced_at("a") < events.len() - 1);
    assert_eq!(cluster.live_sessions(), 0);
}

#[tokio::test]
async fn test_primary_count_is_captured_once() {
    let cluster = InMemoryCluster::new(8, 3);
    let primary = node(&cluster, "primary");
    let a = node(&cluster, "a");
    cluster.script_counts(&primary.config, &[10, 5000]);
    cluster.script_counts(&a.config, &[4, 10]);
    let progress = MemoryProgress::new();

    let report = wait_for_convergence(Arc::new(cluster), &primary, &[a], fast_config(), &progress)
        .await
        .unwrap();

    assert_eq!(report.target, 10);
    assert_eq!(progress.percents_for("a"), vec![40.0, 100.0]);
}

#[tokio::test]
async fn test_abandoning_the_wait_releases_sessions() {
    let cluster = InMemoryCluster::new(8, 3);
    let primary = node(&cluster, "primary");
    let lagging = node(&cluster, "lagging");
    cluster.script_counts(&primary.config, &[1000]);
    cluster.script_counts(&lagging.config, &[10]);
    let monitor = ConvergenceMonitor::new(Arc::new(cluster.clone()), fast_config()).unwrap();
    let progress = MemoryProgress::new();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        monitor.run(&primary, &[lagging], &progress),
    )
    .await;

    assert!(outcome.is_err());
    assert!(progress.percents_for("lagging").len() >= 2);
    assert!(progress.percents_for("lagging").iter().all(|p| *p == 1.0));
    assert_eq!(cluster.live_sessions(), 0);
}

#[tokio::test]
async fn test_unreachable_secondary_fails() {
    let cluster = InMemoryCluster::new(8, 3);
    let primary = node(&cluster, "primary");
    let down = node(&cluster, "down");
    cluster.fail_next_opens(&down.config, 10);

    let err = wait_for_convergence(
        Arc::new(cluster.clone()),
        &primary,
        &[down.clone()],
        fast_config(),
        &MemoryProgress::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ClusterError::Connection { attempts: 2, .. }));
    assert_eq!(cluster.open_attempts(&down.config), 2);
}

#[tokio::test]
async fn test_status_counts() {
    let cluster = InMemoryCluster::new(8, 3);
    let a = node(&cluster, "a");
    let b = node(&cluster, "b");
    cluster.script_counts(&a.config, &[42]);

    let counts = metadata_counts(&cluster, &[a, b], &fast_config()).await.unwrap();

    assert_eq!(counts, vec![("a".to_string(), 42), ("b".to_string(), 0)]);
}
