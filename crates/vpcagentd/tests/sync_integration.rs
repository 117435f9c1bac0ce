//! Sync integration tests
//!
//! Drives the model sync engine against a scripted orchestration API, and
//! both daemon loops against the in-memory northbound database.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vpc_agent_test::{fixtures, sample_topology, MemoryNorthbound, StaticLister};
use vpc_models::{DnsRecord, Resource, Subnet, Vpc};
use vpc_ovnutil::{LogicalRouter, LogicalSwitch, NbDatabase};
use vpcagentd::{Reconciler, ResourceLister, SyncEngine, SyncOutcome};

fn engine(lister: &Arc<StaticLister>, batch: usize) -> SyncEngine {
    let lister: Arc<dyn ResourceLister> = lister.clone();
    SyncEngine::new(lister, batch, Duration::from_millis(20))
}

fn topology_lister() -> Arc<StaticLister> {
    let lister = StaticLister::new();
    lister.put_all(sample_topology());
    Arc::new(lister)
}

/// N records in pages of P cost ceil(N/P) requests when the total is known
#[tokio::test]
async fn test_paged_fetch_request_count() {
    for (count, batch, expected) in [(45, 20, 3), (40, 20, 2), (3, 20, 1), (0, 20, 1)] {
        let lister = StaticLister::new();
        for i in 0..count {
            lister.put(Vpc::KIND, fixtures::vpc(&format!("v{:03}", i), 1));
        }
        let lister = Arc::new(lister);
        let mut engine = engine(&lister, batch);
        engine.run_once().await.expect("sync failed");
        assert_eq!(
            lister.request_count(Vpc::KIND),
            expected,
            "{} records in pages of {}",
            count,
            batch
        );
        let published = engine.published().expect("snapshot");
        assert_eq!(published.vpcs.len(), count);
    }
}

/// Without a reported total, an exact multiple needs one empty page
#[tokio::test]
async fn test_paged_fetch_without_total() {
    let lister = StaticLister::new().without_total();
    for i in 0..40 {
        lister.put(Vpc::KIND, fixtures::vpc(&format!("v{:03}", i), 1));
    }
    let lister = Arc::new(lister);
    let mut engine = engine(&lister, 20);
    engine.run_once().await.expect("sync failed");
    assert_eq!(lister.request_count(Vpc::KIND), 3);
}

/// Later cycles only ask for records changed since the watermark
#[tokio::test]
async fn test_incremental_fetch_uses_watermark() {
    let lister = topology_lister();
    let mut engine = engine(&lister, 100);
    engine.run_once().await.expect("first sync failed");
    lister.clear_requests();

    engine.run_once().await.expect("second sync failed");
    let requests = lister.requests();
    let vpcs = requests
        .iter()
        .find(|(kind, _)| kind == Vpc::KIND)
        .expect("vpc request");
    assert_eq!(vpcs.1.since, Some(fixtures::at(1)));
}

/// Unchanged data is not republished
#[tokio::test]
async fn test_unchanged_cycle_is_not_published() {
    let lister = topology_lister();
    let mut engine = engine(&lister, 100);
    let mut rx = engine.subscribe();

    let first = engine.run_once().await.expect("first sync failed");
    assert!(matches!(first, SyncOutcome::Published(_)));
    assert!(rx.has_changed().expect("sender alive"));
    rx.borrow_and_update();

    let second = engine.run_once().await.expect("second sync failed");
    assert_eq!(second, SyncOutcome::Unchanged);
    assert!(!rx.has_changed().expect("sender alive"));
}

/// An unresolved hard reference keeps the previous snapshot
///
/// Scenario:
/// 1. Publish the sample topology
/// 2. Add a subnet whose virtual network is not listed yet
/// 3. Verify the cycle is rejected and the snapshot is the same object
/// 4. List the virtual network and verify both records are published
#[tokio::test]
async fn test_incorrect_join_keeps_snapshot() {
    let lister = topology_lister();
    let mut engine = engine(&lister, 100);
    engine.run_once().await.expect("first sync failed");
    let before = engine.published().expect("snapshot");

    lister.put(Subnet::KIND, fixtures::subnet("n9", "v9", "10.9.0", 2));
    let outcome = engine.run_once().await.expect("second sync failed");
    assert_eq!(outcome, SyncOutcome::Incorrect);
    let after = engine.published().expect("snapshot");
    assert!(Arc::ptr_eq(&before, &after));
    assert!(!after.subnets.contains("n9"));

    lister.put(Vpc::KIND, fixtures::vpc("v9", 2));
    let outcome = engine.run_once().await.expect("third sync failed");
    assert!(matches!(outcome, SyncOutcome::Published(_)));
    let fixed = engine.published().expect("snapshot");
    assert!(fixed.subnets.contains("n9"));
    assert!(fixed.vpcs.get("v9").expect("v9").subnets.contains("n9"));
}

/// Deleted records leave the next snapshot
#[tokio::test]
async fn test_deleted_record_is_removed() {
    let lister = topology_lister();
    let mut engine = engine(&lister, 100);
    engine.run_once().await.expect("first sync failed");

    lister.put(
        DnsRecord::KIND,
        fixtures::deleted(fixtures::dns_record("d1", "www.cloud.local.", "10.1.0.5", 1), 2),
    );
    let outcome = engine.run_once().await.expect("second sync failed");
    match outcome {
        SyncOutcome::Published(diff) => assert_eq!(diff.total().removed, 1),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(engine.published().expect("snapshot").dns_records.is_empty());
}

/// API failures are retryable and leave the snapshot alone
#[tokio::test]
async fn test_api_failure_keeps_snapshot() {
    let lister = topology_lister();
    let mut engine = engine(&lister, 100);
    engine.run_once().await.expect("first sync failed");
    let before = engine.published().expect("snapshot");

    lister.fail_kind("hosts");
    let err = engine.run_once().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(Arc::ptr_eq(&before, &engine.published().expect("snapshot")));

    lister.heal("hosts");
    let outcome = engine.run_once().await.expect("sync after heal failed");
    assert_eq!(outcome, SyncOutcome::Unchanged);
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Both daemon loops together converge the database and stop on cancel
#[tokio::test]
async fn test_daemon_loops_converge() {
    let lister = topology_lister();
    let nb = MemoryNorthbound::new();
    let db: Arc<dyn NbDatabase> = Arc::new(nb.clone());

    let engine = engine(&lister, 100);
    let reconciler = Reconciler::new(db, engine.subscribe(), Duration::from_secs(60));
    let cancel = CancellationToken::new();
    let sync = tokio::spawn(engine.run(cancel.clone()));
    let worker = tokio::spawn(reconciler.run(cancel.clone()));

    assert!(
        wait_for(|| nb.get_by_name::<LogicalRouter>("vpc-r/v1").is_some()).await,
        "router never created"
    );

    lister.put(Subnet::KIND, fixtures::subnet("n3", "v1", "10.3.0", 2));
    assert!(
        wait_for(|| nb.get_by_name::<LogicalSwitch>("subnet/n3").is_some()).await,
        "new subnet never reconciled"
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), async {
        sync.await.expect("sync loop panicked");
        worker.await.expect("reconcile loop panicked");
    })
    .await
    .expect("loops did not stop");
}
