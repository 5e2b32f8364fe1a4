//! End-to-end indexing scenarios

mod common;

use std::collections::{BTreeSet, HashSet};

use coursegraph_core::config::CommunityConfig;
use coursegraph_core::domain::indexing::{
    AdapterRegistry, CommunityDetector, Corpus, EmbeddingCache, GraphSnapshot, IndexMode, SourceDocument, SourceKind,
};
use coursegraph_core::domain::knowledge::{CandidateEntity, EntityType, GraphStore, RelationshipType};
use coursegraph_core::Error;

use common::{CountingStore, RaftCompletion, orchestrator, resolver};

fn raft_corpus() -> Corpus {
    Corpus::from_documents(vec![
        SourceDocument::new(
            "week1/raft.slides",
            SourceKind::Slides,
            "Raft\nRaft is a consensus algorithm implementing leader election\n---\nSafety\nRaft implements leader election and guarantees strong consistency",
        ),
        SourceDocument::new(
            "week2/paxos.notes",
            SourceKind::Notes,
            "# Paxos\n\nPaxos reaches agreement with a majority quorum.",
        ),
    ])
}

#[tokio::test]
async fn test_raft_chunks_build_expected_graph() {
    let store = CountingStore::new().await;
    let completion = RaftCompletion::new();
    let report = orchestrator(store.clone(), completion)
        .run(&raft_corpus(), IndexMode::Full)
        .await
        .expect("run");
    assert_eq!(report.chunks_failed, 0);

    let entities = store.list_entities().await.expect("entities");
    let named = |name: &str| {
        entities
            .iter()
            .filter(|e| e.display_name.eq_ignore_ascii_case(name))
            .collect::<Vec<_>>()
    };
    assert_eq!(named("Raft").len(), 1);
    assert_eq!(named("leader election").len(), 1);
    let raft = named("Raft")[0];
    let election = named("leader election")[0];
    let consistency = named("strong consistency")[0];

    let relationships = store.list_relationships().await.expect("relationships");
    let implements: Vec<_> = relationships
        .iter()
        .filter(|r| r.rel_type == RelationshipType::Implements)
        .collect();
    assert_eq!(implements.len(), 1);
    assert_eq!(implements[0].source_id, raft.id);
    assert_eq!(implements[0].target_id, election.id);
    assert_eq!(implements[0].evidence_chunk_ids.len(), 2);

    let guarantees: Vec<_> = relationships
        .iter()
        .filter(|r| r.rel_type == RelationshipType::Guarantees)
        .collect();
    assert_eq!(guarantees.len(), 1);
    assert_eq!(guarantees[0].target_id, consistency.id);

    let communities = store.list_communities().await.expect("communities");
    assert_eq!(report.communities_built, communities.len());
    assert!(communities.iter().all(|c| !c.summary.is_empty()));
}

#[tokio::test]
async fn test_second_incremental_run_writes_nothing() {
    let store = CountingStore::new().await;
    let completion = RaftCompletion::new();
    let orchestrator = orchestrator(store.clone(), completion.clone());
    let corpus = raft_corpus();

    orchestrator.run(&corpus, IndexMode::Incremental).await.expect("first run");
    let writes = store.writes();
    let calls = completion.calls();
    assert!(writes > 0);

    let second = orchestrator.run(&corpus, IndexMode::Incremental).await.expect("second run");
    assert_eq!(store.writes(), writes);
    assert_eq!(completion.calls(), calls);
    assert_eq!(second.graph_writes, 0);
    assert_eq!(second.chunks_processed, 0);
    assert_eq!(second.chunks_skipped, second.chunks_seen);
}

#[tokio::test]
async fn test_full_rerun_converges_to_same_graph() {
    let store = CountingStore::new().await;
    let orchestrator = orchestrator(store.clone(), RaftCompletion::new());
    let corpus = raft_corpus();

    orchestrator.run(&corpus, IndexMode::Full).await.expect("first run");
    let entities = store.list_entities().await.expect("entities");
    let relationships = store.list_relationships().await.expect("relationships");

    orchestrator.run(&corpus, IndexMode::Full).await.expect("second run");
    assert_eq!(store.list_entities().await.expect("entities"), entities);
    assert_eq!(store.list_relationships().await.expect("relationships"), relationships);
}

#[tokio::test]
async fn test_store_outage_aborts_and_retry_picks_up_incomplete_chunks() {
    let store = CountingStore::new().await;
    let completion = RaftCompletion::new();
    let orchestrator = orchestrator(store.clone(), completion);
    let corpus = raft_corpus();

    // Entities succeed, then the store drops before any hash is recorded
    store.fail_after.store(3, std::sync::atomic::Ordering::SeqCst);
    let err = orchestrator
        .run(&corpus, IndexMode::Incremental)
        .await
        .expect_err("store outage aborts");
    assert!(err.is_store_failure());
    assert!(matches!(err, Error::StoreUnavailable(_)));
    for source in &corpus.sources {
        assert!(store.chunk_hashes_for_source(&source.source_id).await.expect("hashes").is_empty());
    }

    store.fail_after.store(usize::MAX, std::sync::atomic::Ordering::SeqCst);
    let retry = orchestrator.run(&corpus, IndexMode::Incremental).await.expect("retry");
    assert_eq!(retry.chunks_skipped, 0);
    assert_eq!(retry.chunks_processed, retry.chunks_seen);
}

#[tokio::test]
async fn test_prepended_section_keeps_evidence_on_its_text() {
    let store = CountingStore::new().await;
    let orchestrator = orchestrator(store.clone(), RaftCompletion::new());
    let v1 = SourceDocument::new("a.notes", SourceKind::Notes, "# Raft\n\nRaft implements leader election");
    let v2 = SourceDocument::new(
        "a.notes",
        SourceKind::Notes,
        "# Intro\n\nPaxos is older\n\n# Raft\n\nRaft implements leader election",
    );

    orchestrator
        .run(&Corpus::from_documents(vec![v1]), IndexMode::Incremental)
        .await
        .expect("v1");
    let report = orchestrator
        .run(&Corpus::from_documents(vec![v2.clone()]), IndexMode::Incremental)
        .await
        .expect("v2");
    assert_eq!(report.chunks_skipped, 1);
    assert_eq!(report.chunks_processed, 1);

    let chunks = AdapterRegistry::default().normalize(&v2).expect("normalize");
    let text_of = |id: &str| {
        chunks
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.text.clone())
            .unwrap_or_else(|| panic!("evidence {} names no current chunk", id))
    };

    let relationships = store.list_relationships().await.expect("relationships");
    let implements = relationships
        .iter()
        .find(|r| r.rel_type == RelationshipType::Implements)
        .expect("IMPLEMENTS edge");
    assert!(!implements.evidence_chunk_ids.is_empty());
    for id in &implements.evidence_chunk_ids {
        assert!(text_of(id).contains("Raft implements"));
    }

    let entities = store.list_entities().await.expect("entities");
    let paxos = entities
        .iter()
        .find(|e| e.display_name == "Paxos")
        .expect("Paxos");
    for id in &paxos.evidence_chunk_ids {
        assert!(text_of(id).contains("Paxos is older"));
    }
}

#[tokio::test]
async fn test_staging_sample_is_reproducible() {
    let sources: Vec<SourceDocument> = (0..40)
        .map(|i| {
            SourceDocument::new(
                format!("lectures/{:02}.notes", i),
                SourceKind::Notes,
                format!("# Lecture {}\n\nRaft implements leader election", i),
            )
        })
        .collect();
    let corpus = Corpus::from_documents(sources);

    let mut selections = Vec::new();
    for _ in 0..2 {
        let store = CountingStore::new().await;
        let report = orchestrator(store.clone(), RaftCompletion::new())
            .run(&corpus, IndexMode::Staging)
            .await
            .expect("staging run");
        let mut selected = BTreeSet::new();
        for source in &corpus.sources {
            if !store.chunk_hashes_for_source(&source.source_id).await.expect("hashes").is_empty() {
                selected.insert(source.source_id.clone());
            }
        }
        assert_eq!(selected.len(), report.sources_selected);
        assert!(report.sources_selected < corpus.len());
        selections.push(selected);
    }
    assert_eq!(selections[0], selections[1]);
}

#[tokio::test]
async fn test_resolution_ignores_candidate_order() {
    let names = [
        ("Raft", EntityType::Algorithm, "w1#0"),
        ("raft", EntityType::Algorithm, "w2#3"),
        ("  RAFT ", EntityType::Algorithm, "w3#1"),
        ("leader election", EntityType::Protocol, "w1#0"),
        ("Leader Election", EntityType::Protocol, "w4#2"),
        ("Paxos", EntityType::Algorithm, "w5#0"),
    ];
    let candidates: Vec<CandidateEntity> = names
        .iter()
        .map(|(name, t, chunk)| CandidateEntity::new(*name, *t, *chunk))
        .collect();
    let mut reversed = candidates.clone();
    reversed.reverse();
    let mut rotated = candidates.clone();
    rotated.rotate_left(2);

    let resolver = resolver();
    let mut outcomes = Vec::new();
    for input in [&candidates, &reversed, &rotated] {
        let outcome = resolver
            .resolve(input, &[], &mut EmbeddingCache::new())
            .await
            .expect("resolve");
        outcomes.push((outcome.entities, outcome.assignments));
    }
    assert_eq!(outcomes[0].0.len(), 3);
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0], outcomes[2]);
}

#[tokio::test]
async fn test_indexed_graph_communities_partition_every_level() {
    let store = CountingStore::new().await;
    orchestrator(store.clone(), RaftCompletion::new())
        .run(&raft_corpus(), IndexMode::Full)
        .await
        .expect("run");

    let snapshot = GraphSnapshot {
        entities: store.list_entities().await.expect("entities"),
        relationships: store.list_relationships().await.expect("relationships"),
    };
    let all: HashSet<String> = snapshot.entities.iter().map(|e| e.id.clone()).collect();

    let detector = CommunityDetector::new(&CommunityConfig::default());
    let communities = detector.detect(&snapshot, 1.0);
    let levels: BTreeSet<u32> = communities.iter().map(|c| c.level).collect();
    assert!(levels.contains(&0));

    for level in levels {
        let mut seen = HashSet::new();
        for community in communities.iter().filter(|c| c.level == level) {
            for id in &community.member_entity_ids {
                assert!(seen.insert(id.clone()), "{} appears twice at level {}", id, level);
            }
        }
        assert_eq!(seen, all);
    }

    let again = detector.detect(&snapshot, 1.0);
    let level0 = |cs: &[coursegraph_core::domain::knowledge::Community]| {
        cs.iter()
            .filter(|c| c.level == 0)
            .map(|c| c.member_entity_ids.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(level0(&communities), level0(&again));
}
