/// Shard map update tests
///
/// Pre-flight checks, fan-out rewrite and re-runs against an in-memory cluster
/// Run with: cargo test --test reconcile_tests

use couchshard::{
    ClusterError, ClusterSettings, InMemoryCluster, MemoryProgress, MetadataRewriter,
    PipelineConfig, Preflight, ReconcileOptions, RetryPolicy, SessionFactory, ShardMapDocument,
    UpdateReport, update_metadata,
};
use std::sync::Arc;
use std::time::Duration;

const RANGES: [&str; 4] = [
    "00000000-3fffffff",
    "40000000-7fffffff",
    "80000000-bfffffff",
    "c0000000-ffffffff",
];

fn old_layout() -> ShardMapDocument {
    RANGES.iter().fold(ShardMapDocument::new(), |doc, range| {
        doc.with_assignment(range, &["couchdb@old-1", "couchdb@old-2"])
    })
}

fn seeded_cluster(q: usize, n: usize, databases: usize) -> Arc<InMemoryCluster> {
    let cluster = InMemoryCluster::new(q, n);
    cluster.set_membership(
        &["couchdb@new-1", "couchdb@new-2", "couchdb@new-3"],
        &["couchdb@new-1", "couchdb@new-2", "couchdb@new-3"],
    );
    let doc = old_layout();
    for i in 0..databases {
        cluster.insert_shard_map(&format!("tenant-{:04}", i), &doc);
    }
    Arc::new(cluster)
}

fn options(cluster: &InMemoryCluster) -> ReconcileOptions {
    ReconcileOptions::new(cluster.endpoint("new-1").unwrap())
        .pipeline(
            PipelineConfig::default()
                .workers(4)
                .batch_size(10)
                .retry(RetryPolicy::new(2, Duration::from_millis(1))),
        )
        .page_size(30)
}

fn targets() -> Vec<String> {
    vec![
        "couchdb@new-1".to_string(),
        "couchdb@new-2".to_string(),
        "couchdb@new-3".to_string(),
    ]
}

#[tokio::test]
async fn test_every_database_is_fanned_out() {
    let cluster = seeded_cluster(4, 3, 250);
    let progress = Arc::new(MemoryProgress::new());

    let report = update_metadata(cluster.clone(), &options(&cluster), progress)
        .await
        .unwrap();

    let UpdateReport::Rewritten(stats) = report else {
        panic!("expected a rewrite, got {report:?}");
    };
    assert_eq!(stats.applied, 250);
    assert_eq!(stats.skipped, 0);

    for name in cluster.database_names() {
        assert_eq!(cluster.writes(&name), 1, "{}", name);
        let doc = cluster.shard_map(&name).unwrap();
        assert_eq!(doc.node_set().into_iter().collect::<Vec<_>>(), targets());
        assert_eq!(doc.by_range.len(), 4);
        for owners in doc.by_range.values() {
            assert_eq!(owners, &targets());
        }
        for ranges in doc.by_node.values() {
            assert_eq!(ranges.len(), 4);
        }
        assert_eq!(doc.changelog.len(), 12);
        assert_eq!(doc.extra.get("_id"), Some(&serde_json::json!(name)));
    }
}

#[tokio::test]
async fn test_second_run_only_reads_the_preflight_document() {
    let cluster = seeded_cluster(4, 3, 120);
    update_metadata(cluster.clone(), &options(&cluster), Arc::new(MemoryProgress::new()))
        .await
        .unwrap();

    let reads = cluster.total_reads();
    let writes = cluster.total_writes();
    let first_state: Vec<ShardMapDocument> = cluster
        .database_names()
        .iter()
        .map(|name| cluster.shard_map(name).unwrap())
        .collect();

    let report = update_metadata(cluster.clone(), &options(&cluster), Arc::new(MemoryProgress::new()))
        .await
        .unwrap();

    assert_eq!(
        report,
        UpdateReport::AlreadyAligned {
            database: "tenant-0000".to_string()
        }
    );
    assert_eq!(cluster.total_reads(), reads + 1);
    assert_eq!(cluster.total_writes(), writes);
    let second_state: Vec<ShardMapDocument> = cluster
        .database_names()
        .iter()
        .map(|name| cluster.shard_map(name).unwrap())
        .collect();
    assert_eq!(first_state, second_state);
}

#[tokio::test]
async fn test_shard_count_mismatch_stops_before_any_write() {
    let cluster = seeded_cluster(2, 3, 50);

    let err = update_metadata(cluster.clone(), &options(&cluster), Arc::new(MemoryProgress::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::ConfigurationMismatch(_)), "{err:?}");
    assert_eq!(cluster.total_writes(), 0);
    assert_eq!(cluster.total_reads(), 1);
}

#[tokio::test]
async fn test_too_few_targets_for_replica_count() {
    let cluster = seeded_cluster(4, 3, 5);
    let options = options(&cluster).target_nodes(vec!["couchdb@new-1".to_string(), "couchdb@new-2".to_string()]);

    let err = update_metadata(cluster.clone(), &options, Arc::new(MemoryProgress::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::ConfigurationMismatch(_)), "{err:?}");
    assert_eq!(cluster.total_writes(), 0);
}

#[tokio::test]
async fn test_empty_cluster_is_a_no_op() {
    let cluster = seeded_cluster(4, 3, 0);

    let report = update_metadata(cluster.clone(), &options(&cluster), Arc::new(MemoryProgress::new()))
        .await
        .unwrap();

    assert_eq!(report, UpdateReport::NoDatabases);
    assert_eq!(cluster.total_reads(), 0);
}

#[tokio::test]
async fn test_vanished_database_is_skipped() {
    let cluster = seeded_cluster(4, 3, 40);
    cluster.vanish("tenant-0017");
    let progress = Arc::new(MemoryProgress::new());

    let report = update_metadata(cluster.clone(), &options(&cluster), progress.clone())
        .await
        .unwrap();

    assert_eq!(
        report,
        UpdateReport::Rewritten(couchshard::PipelineReport {
            batches: 4,
            applied: 39,
            skipped: 1,
        })
    );
    assert_eq!(cluster.writes("tenant-0017"), 0);
    assert!(progress.events().contains(&couchshard::ProgressEvent::ItemSkipped {
        item: "tenant-0017".to_string()
    }));
}

#[tokio::test]
async fn test_failed_write_aborts_and_rerun_completes() {
    let cluster = seeded_cluster(4, 3, 300);
    cluster.fail_writes_for("tenant-0005");
    let options = options(&cluster).pipeline(
        PipelineConfig::default()
            .workers(2)
            .batch_size(5)
            .retry(RetryPolicy::new(2, Duration::from_millis(1))),
    );

    let err = update_metadata(cluster.clone(), &options, Arc::new(MemoryProgress::new()))
        .await
        .unwrap_err();
    match err {
        ClusterError::Transform { item, .. } => assert_eq!(item, "tenant-0005"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(cluster.total_writes() < 300);

    // A fresh cluster view without the fault: everything converges on re-run.
    let healed = seeded_cluster(4, 3, 0);
    for name in cluster.database_names() {
        healed.insert_shard_map(&name, &cluster.shard_map(&name).unwrap());
    }
    let report = update_metadata(healed.clone(), &options, Arc::new(MemoryProgress::new()))
        .await
        .unwrap();
    assert!(matches!(report, UpdateReport::AlreadyAligned { .. }));

    let report = update_metadata(healed.clone(), &options.clone().force(true), Arc::new(MemoryProgress::new()))
        .await
        .unwrap();
    assert!(matches!(report, UpdateReport::Rewritten(stats) if stats.applied == 300));
    for name in healed.database_names() {
        assert_eq!(healed.shard_map(&name).unwrap().node_set().len(), 3, "{}", name);
    }
}

#[tokio::test]
async fn test_preflight_ignores_target_order() {
    let cluster = seeded_cluster(4, 3, 1);
    let mut session = cluster.open(&cluster.endpoint("new-1").unwrap()).await.unwrap();
    let rewriter = MetadataRewriter::new(vec![
        "couchdb@old-2".to_string(),
        "couchdb@old-1".to_string(),
    ])
    .unwrap();

    let preflight = rewriter
        .preflight(&mut session, "tenant-0000", ClusterSettings { q: 4, n: 2 })
        .await
        .unwrap();
    assert_eq!(
        preflight,
        Preflight::AlreadyAligned {
            database: "tenant-0000".to_string()
        }
    );

    let err = rewriter
        .preflight(&mut session, "missing", ClusterSettings { q: 4, n: 2 })
        .await
        .unwrap_err();
    assert!(err.is_document_missing());
}
