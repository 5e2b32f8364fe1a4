//! Fact log and sync worker behaviour against a flaky graph store

mod common;

use std::time::Duration;

use coursegraph_core::config::SyncConfig;
use coursegraph_core::domain::knowledge::GraphStore;
use coursegraph_core::domain::memory::{
    CircuitStateKind, FactLog, LearningEvent, LearningEventType, SyncWorker, WalState,
};
use coursegraph_core::infrastructure::graph::SqliteGraphStore;

use common::CountingStore;

fn sync_config() -> SyncConfig {
    SyncConfig {
        batch_size: 10,
        max_attempts: 20,
        backoff_base_ms: 0,
        backoff_max_ms: 0,
        failure_threshold: 5,
        cooldown_secs: 1,
        poll_interval_ms: 50,
    }
}

fn event(concept: &str) -> LearningEvent {
    LearningEvent::new(
        "student_1a2b3c4d",
        concept,
        LearningEventType::Struggling,
        0.9,
        format!("confused {} with something else", concept),
    )
}

#[tokio::test]
async fn test_outage_opens_circuit_then_drains_without_duplicates() {
    let log = FactLog::in_memory().await.expect("log");
    let store = CountingStore::new().await;
    let mut worker = SyncWorker::new(log.clone(), store.clone(), &sync_config());

    let concepts = ["Raft", "Paxos", "quorum", "leader lease", "vector clock"];
    for concept in concepts {
        log.append(&event(concept)).await.expect("append");
    }

    store.set_failing(true);
    let pass = worker.drain_once().await.expect("drain");
    assert_eq!(pass.failed, 5);
    assert_eq!(worker.breaker_state(), CircuitStateKind::Open);
    assert_eq!(log.scan(WalState::Failed).await.expect("scan").len(), 5);

    // Appends keep landing in the log while the circuit is open
    log.append(&event("two-phase commit")).await.expect("append");
    log.append(&event("gossip")).await.expect("append");
    let pass = worker.drain_once().await.expect("drain");
    assert_eq!(pass.dispatched, 0);
    assert_eq!(pass.deferred, 7);

    store.set_failing(false);
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let report = worker.drain_all().await.expect("drain all");
    assert_eq!(report.committed, 7);
    assert_eq!(report.already_applied, 0);
    assert_eq!(worker.breaker_state(), CircuitStateKind::Closed);
    assert_eq!(store.count_learning_events().await.expect("count"), 7);

    // A re-extracted copy of a committed fact folds into its record
    let again = worker.drain_all().await.expect("drain all");
    assert!(again.is_idle());
    log.append(&event("Raft")).await.expect("append");
    assert!(worker.drain_all().await.expect("drain all").is_idle());
    assert_eq!(store.count_learning_events().await.expect("count"), 7);

    let stats = log.stats().await.expect("stats");
    assert_eq!(stats.committed, 7);
    assert_eq!(stats.pending + stats.failed + stats.writing + stats.dead_letter, 0);
}

#[tokio::test]
async fn test_log_survives_restart_and_applies_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("facts.db");
    let store = SqliteGraphStore::in_memory().await.expect("store");
    let fact = event("Byzantine fault tolerance");

    let record_id = {
        let log = FactLog::open(&path).await.expect("open");
        let record_id = log.append(&fact).await.expect("append");
        // Crash after the graph write but before the commit was logged
        log.transition(&record_id, WalState::Writing).await.expect("writing");
        assert!(store
            .apply_learning_event(&fact, &fact.idempotency_key())
            .await
            .expect("apply"));
        record_id
    };

    let log = FactLog::open(&path).await.expect("reopen");
    assert_eq!(log.get(&record_id).await.expect("get").map(|r| r.state), Some(WalState::Writing));
    assert_eq!(log.recover().await.expect("recover"), 1);
    assert_eq!(log.get(&record_id).await.expect("get").map(|r| r.attempt_count), Some(0));
    assert_eq!(log.append(&fact).await.expect("re-append"), record_id);

    let mut worker = SyncWorker::new(log.clone(), std::sync::Arc::new(store.clone()), &sync_config());
    let report = worker.drain_all().await.expect("drain");
    assert_eq!(report.committed, 1);
    assert_eq!(report.already_applied, 1);
    assert_eq!(store.count_learning_events().await.expect("count"), 1);
    let committed = log.get(&record_id).await.expect("get").expect("record");
    assert_eq!(committed.state, WalState::Committed);
    assert_eq!(committed.attempt_count, 1);
}

#[tokio::test]
async fn test_exhausted_record_is_dead_lettered() {
    let log = FactLog::in_memory().await.expect("log");
    let store = CountingStore::new().await;
    let config = SyncConfig {
        max_attempts: 2,
        failure_threshold: 100,
        ..sync_config()
    };
    let mut worker = SyncWorker::new(log.clone(), store.clone(), &config);
    let record_id = log.append(&event("CRDT")).await.expect("append");

    store.set_failing(true);
    worker.drain_once().await.expect("first attempt");
    let second = worker.drain_once().await.expect("second attempt");
    assert_eq!(second.dead_lettered, 1);

    let dead = log.dead_letters().await.expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].record_id, record_id);
    assert_eq!(dead[0].attempt_count, 2);

    store.set_failing(false);
    assert!(worker.drain_all().await.expect("drain").is_idle());
    assert_eq!(store.count_learning_events().await.expect("count"), 0);
}
