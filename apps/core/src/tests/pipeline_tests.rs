//! Pipeline Tests
//!
//! Stage A, direction selection, Stage B and resplit over a synthetic corpus whose
//! structure the mock provider makes explicit:
//!
//! - "wedding cake N" and "wedding dress N": two sub-topics sharing "wedding"
//! - "kitchen remodel N" and "garden layout N": two unrelated topics
//! - "misc query N": isolated points
//!
//! The trailing number picks each phrase's jitter axis, so no two texts collide.

use super::cache_tests::{MockEmbeddingProvider, MOCK_MODEL};
use crate::actors::cache::EmbeddingCacheHandle;
use crate::clustering::ClusteringEngine;
use crate::config::PipelineConfig;
use crate::embedding::store::{InMemoryVectorStore, VectorStore};
use crate::error::AppError;
use crate::models::{ClusterId, Direction, PhraseId, Stage};
use crate::pipeline::corpus::REQUIRED_COLUMNS;
use crate::pipeline::directions::top_n_by_frequency;
use crate::pipeline::{Corpus, CorpusOptions, ExclusionReason, Pipeline, RawPhraseRecord, StageAResult};
use std::collections::BTreeSet;
use std::sync::Arc;

const ROUND: &str = "round-1";
const TOPICS: [&str; 5] = ["wedding", "cake", "dress", "kitchen", "garden"];

const CAKE: std::ops::Range<u64> = 0..15;
const DRESS: std::ops::Range<u64> = 15..30;
const KITCHEN: std::ops::Range<u64> = 30..55;
const GARDEN: std::ops::Range<u64> = 55..75;
const MISC: std::ops::Range<u64> = 75..80;
/// "wedding-cake 3": normalizes to the same text as phrase 3.
const VARIANT_ID: PhraseId = 80;
const EMPTY_IDS: [PhraseId; 2] = [81, 82];

// ============================================================================
// Fixtures
// ============================================================================

fn record(phrase: &str, seed: &str, frequency: f64) -> RawPhraseRecord {
    RawPhraseRecord {
        phrase: Some(phrase.to_string()),
        seed_word: Some(seed.to_string()),
        source_type: Some("dropdown".to_string()),
        frequency: Some(frequency),
        volume: None,
    }
}

fn corpus() -> Corpus {
    let mut records = Vec::new();
    records.extend(CAKE.map(|i| record(&format!("wedding cake {}", i), "wedding", 20.0)));
    records.extend(DRESS.map(|i| record(&format!("wedding dress {}", i), "wedding", 5.0)));
    records.extend(KITCHEN.map(|i| record(&format!("kitchen remodel {}", i), "kitchen", 8.0)));
    records.extend(GARDEN.map(|i| record(&format!("garden layout {}", i), "garden", 1.0)));
    records.extend(MISC.map(|i| record(&format!("misc query {}", i), "misc", 100.0)));
    // Same text up to case: folded into phrase 3.
    records.push(record("Wedding Cake 3", "wedding", 20.0));
    records.push(record("wedding-cake 3", "wedding", 20.0));
    records.push(record("PDF 2024", "misc", 1.0));
    records.push(record("!!!", "misc", 1.0));

    Corpus::from_records(&REQUIRED_COLUMNS, records, CorpusOptions::default()).unwrap()
}

fn provider() -> MockEmbeddingProvider {
    MockEmbeddingProvider::new(128).with_topics(&TOPICS)
}

fn config(resplit_threshold: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.round_id = ROUND.to_string();
    config.embedding.model_id = MOCK_MODEL.to_string();
    config.resplit_threshold = resplit_threshold;
    config
}

fn pipeline(provider: MockEmbeddingProvider, config: &PipelineConfig) -> Pipeline {
    let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let cache = EmbeddingCacheHandle::spawn(
        config.round_id.clone(),
        store,
        Arc::new(provider),
        config.embedding.cache_options(),
    );
    Pipeline::new(config, cache, ClusteringEngine::default()).unwrap()
}

fn ids(range: std::ops::Range<u64>) -> BTreeSet<PhraseId> {
    range.collect()
}

fn members_of(result: &StageAResult, label: i32) -> &BTreeSet<PhraseId> {
    &result
        .cluster(&ClusterId::from_label(label))
        .unwrap()
        .member_phrase_ids
}

// ============================================================================
// Stage A
// ============================================================================

#[tokio::test]
async fn test_stage_a_finds_topics() {
    let corpus = corpus();
    assert_eq!(corpus.len(), 83);
    assert_eq!(corpus.merged_rows(), 1);

    let result = pipeline(provider(), &config(1_000))
        .run_stage_a(&corpus)
        .await
        .unwrap();

    let mut cake = ids(CAKE);
    cake.insert(VARIANT_ID);
    assert_eq!(members_of(&result, 0), &cake);
    assert_eq!(members_of(&result, 1), &ids(DRESS));
    assert_eq!(members_of(&result, 2), &ids(KITCHEN));
    assert_eq!(members_of(&result, 3), &ids(GARDEN));
    assert_eq!(result.cluster(&ClusterId::noise()).unwrap().member_phrase_ids, ids(MISC));

    assert_eq!(result.report.cluster_count, 4);
    assert_eq!(result.report.noise_phrases, 5);
    assert!(result.report.is_balanced());
    assert_eq!(result.params.map(|p| p.min_cluster_size), Some(8));

    let excluded: Vec<PhraseId> = result.excluded.iter().map(|e| e.phrase_id).collect();
    assert_eq!(excluded, EMPTY_IDS.to_vec());
    assert!(result
        .excluded
        .iter()
        .all(|e| e.reason == ExclusionReason::EmptyAfterNormalization));

    // Every non-excluded phrase has exactly one assignment.
    assert_eq!(result.assignments.len(), 81);
    let assigned: BTreeSet<PhraseId> = result.assignments.iter().map(|a| a.phrase_id).collect();
    assert_eq!(assigned.len(), 81);
    assert!(result.clusters.iter().all(|c| c.stage == Stage::A));

    // The noise summary comes last; the rest by total frequency.
    let order: Vec<String> = result
        .summaries
        .iter()
        .map(|s| s.cluster_id.to_string())
        .collect();
    assert_eq!(order, vec!["0", "2", "1", "3", "-1"]);
    assert_eq!(result.summaries[0].total_frequency, 340.0);
}

#[tokio::test]
async fn test_stage_a_excludes_phrases_outside_length_bounds() {
    let corpus = corpus();
    let mut config = config(1_000);
    // "PDF 2024" has 8 characters, "!!!" has 3; every topical phrase has more.
    config.phrase_length.min_chars = 9;

    let result = pipeline(provider(), &config)
        .run_stage_a(&corpus)
        .await
        .unwrap();

    let excluded: Vec<PhraseId> = result.excluded.iter().map(|e| e.phrase_id).collect();
    assert_eq!(excluded, EMPTY_IDS.to_vec());
    assert!(result
        .excluded
        .iter()
        .all(|e| e.reason == ExclusionReason::LengthOutOfBounds));
    assert_eq!(
        result.report.excluded_phrases.get(&ExclusionReason::LengthOutOfBounds),
        Some(&2)
    );
    assert_eq!(result.report.cluster_count, 4);
    assert!(result.report.is_balanced());
}

#[tokio::test]
async fn test_stage_a_tolerates_few_provider_failures() {
    let corpus = corpus();
    let provider = provider().failing_on(&["garden layout 60"]);
    let result = pipeline(provider, &config(1_000))
        .run_stage_a(&corpus)
        .await
        .unwrap();

    let failed: Vec<PhraseId> = result
        .excluded
        .iter()
        .filter(|e| e.reason == ExclusionReason::EmbeddingFailed)
        .map(|e| e.phrase_id)
        .collect();
    assert_eq!(failed, vec![60]);
    assert!(result.report.is_balanced());
    assert!(!members_of(&result, 3).contains(&60));
}

#[tokio::test]
async fn test_stage_a_fails_above_failure_rate() {
    let corpus = corpus();
    let failing: Vec<String> = (0..10).map(|i| format!("wedding cake {}", i)).collect();
    let failing: Vec<&str> = failing.iter().map(String::as_str).collect();
    let result = pipeline(provider().failing_on(&failing), &config(1_000))
        .run_stage_a(&corpus)
        .await;

    assert!(matches!(result, Err(AppError::EmbeddingProvider(_))));
}

// ============================================================================
// Directions and Stage B
// ============================================================================

#[tokio::test]
async fn test_stage_b_merges_keyword_matches() {
    let corpus = corpus();
    let pipeline = pipeline(provider(), &config(1_000));
    let stage_a = pipeline.run_stage_a(&corpus).await.unwrap();

    let directions = top_n_by_frequency(&stage_a.summaries, 2, ROUND);
    assert_eq!(
        directions,
        vec![
            Direction::new("wedding", ClusterId::from_label(0), ROUND),
            Direction::new("kitchen", ClusterId::from_label(2), ROUND),
        ]
    );

    let stage_b = pipeline.run_stage_b(&corpus, &stage_a, &directions).await.unwrap();
    assert_eq!(stage_b.stage_a_generation, stage_a.generation);
    assert_eq!(stage_b.directions.len(), 2);

    let wedding = stage_b.direction("wedding").unwrap();
    assert_eq!(wedding.keyword_matches, 15);
    assert_eq!(wedding.rows.len(), 31);
    assert_eq!(wedding.report.cluster_count, 2);
    assert_eq!(wedding.report.noise_phrases, 0);
    assert!(wedding.report.is_balanced());

    let mut cake = ids(CAKE);
    cake.insert(VARIANT_ID);
    let partition: BTreeSet<BTreeSet<PhraseId>> = wedding
        .clusters
        .iter()
        .map(|c| c.member_phrase_ids.clone())
        .collect();
    assert_eq!(partition, BTreeSet::from([cake, ids(DRESS)]));

    let dress_row = wedding.rows.iter().find(|r| r.phrase_id == 20).unwrap();
    assert_eq!(dress_row.cluster_id_a, Some(ClusterId::from_label(1)));
    assert!(wedding
        .summaries
        .iter()
        .all(|s| s.direction_keyword.as_deref() == Some("wedding") && s.stage == Stage::B));

    // Each direction partitions its own subset.
    let kitchen = stage_b.direction("kitchen").unwrap();
    assert_eq!(kitchen.keyword_matches, 0);
    let covered: BTreeSet<PhraseId> = kitchen.rows.iter().map(|r| r.phrase_id).collect();
    assert_eq!(covered, ids(KITCHEN));
    assert_eq!(kitchen.rows.len(), 25);
}

#[tokio::test]
async fn test_stage_b_rerun_is_identical() {
    let corpus = corpus();
    let pipeline = pipeline(provider(), &config(1_000));
    let stage_a = pipeline.run_stage_a(&corpus).await.unwrap();
    let directions = top_n_by_frequency(&stage_a.summaries, 2, ROUND);

    let first = pipeline.run_stage_b(&corpus, &stage_a, &directions).await.unwrap();
    let second = pipeline.run_stage_b(&corpus, &stage_a, &directions).await.unwrap();

    for (a, b) in first.directions.iter().zip(&second.directions) {
        assert_eq!(a.clusters, b.clusters);
        assert_eq!(a.rows, b.rows);
        let sizes = |d: &crate::pipeline::DirectionResult| -> Vec<(usize, f64)> {
            d.summaries.iter().map(|s| (s.size, s.total_frequency)).collect()
        };
        assert_eq!(sizes(a), sizes(b));
        assert_eq!(b.report.cache.computed, 0);
    }
}

#[tokio::test]
async fn test_stage_b_label_only_direction_skips_keyword_matching() {
    let corpus = corpus();
    let pipeline = pipeline(provider(), &config(1_000));
    let stage_a = pipeline.run_stage_a(&corpus).await.unwrap();
    // Same source and word as the "wedding" direction, but only as a label.
    let directions = vec![Direction::label_only("wedding", ClusterId::from_label(0), ROUND)];

    let stage_b = pipeline.run_stage_b(&corpus, &stage_a, &directions).await.unwrap();
    let direction = stage_b.direction("wedding").unwrap();

    assert_eq!(direction.keyword_matches, 0);
    let mut cake = ids(CAKE);
    cake.insert(VARIANT_ID);
    let covered: BTreeSet<PhraseId> = direction.rows.iter().map(|r| r.phrase_id).collect();
    assert_eq!(covered, cake);
}

#[tokio::test]
async fn test_stage_b_rejects_bad_directions() {
    let corpus = corpus();
    let pipeline = pipeline(provider(), &config(1_000));
    let stage_a = pipeline.run_stage_a(&corpus).await.unwrap();
    let good = Direction::new("wedding", ClusterId::from_label(0), ROUND);

    let cases = vec![
        vec![Direction::new("misc", ClusterId::noise(), ROUND)],
        vec![Direction::new("wedding", ClusterId::from_label(0), "round-2")],
        vec![Direction::new("wedding", ClusterId::from_label(42), ROUND)],
        vec![Direction::new("PDF", ClusterId::from_label(1), ROUND)],
        vec![good.clone(), Direction::new("wedding", ClusterId::from_label(1), ROUND)],
        vec![good, Direction::new("", ClusterId::from_label(2), ROUND)],
        vec![],
    ];
    for directions in cases {
        let result = pipeline.run_stage_b(&corpus, &stage_a, &directions).await;
        assert!(
            matches!(result, Err(AppError::Validation(_))),
            "accepted {:?}",
            directions
        );
    }
}

// ============================================================================
// Resplit
// ============================================================================

#[tokio::test]
async fn test_resplit_oversized_conserves_members() {
    let corpus = corpus();
    let pipeline = pipeline(provider(), &config(20));
    let stage_a = pipeline.run_stage_a(&corpus).await.unwrap();

    let runs = pipeline
        .resplit_oversized(&corpus, &stage_a.clusters, None)
        .await
        .unwrap();
    // Only kitchen (25) is above 20; garden sits exactly at the threshold.
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.parent, ClusterId::from_label(2));
    assert!(run.report.is_balanced());

    let covered: BTreeSet<PhraseId> = run
        .clusters
        .iter()
        .flat_map(|c| c.member_phrase_ids.iter().copied())
        .collect();
    assert_eq!(covered, ids(KITCHEN));
    assert_eq!(run.rows.len(), 25);
    for cluster in &run.clusters {
        assert_eq!(cluster.cluster_id.parent(), Some(ClusterId::from_label(2)));
        assert_eq!(cluster.stage, Stage::Resplit);
    }
}

#[tokio::test]
async fn test_resplit_separates_sub_topics() {
    let corpus = corpus();
    let pipeline = pipeline(provider(), &config(20));
    let stage_a = pipeline.run_stage_a(&corpus).await.unwrap();

    // A coarse cluster that lumps both wedding sub-topics together.
    let mut lumped = stage_a.cluster(&ClusterId::from_label(0)).unwrap().clone();
    lumped
        .member_phrase_ids
        .extend(members_of(&stage_a, 1).iter().copied());
    assert_eq!(lumped.size(), 31);

    let run = pipeline.resplit(&corpus, &lumped, None).await.unwrap().unwrap();
    let sub_clusters: Vec<_> = run.clusters.iter().filter(|c| !c.is_noise).collect();
    assert!(sub_clusters.len() >= 2);
    for cluster in sub_clusters {
        let in_dress = cluster
            .member_phrase_ids
            .iter()
            .filter(|id| DRESS.contains(*id))
            .count();
        assert!(in_dress == 0 || in_dress == cluster.size(), "mixed {}", cluster.cluster_id);
    }
    let total: usize = run.clusters.iter().map(|c| c.size()).sum();
    assert_eq!(total, 31);
    assert!(run.summaries.iter().all(|s| s.stage == Stage::Resplit));
}

#[tokio::test]
async fn test_resplit_skips_small_and_rejects_noise() {
    let corpus = corpus();
    let pipeline = pipeline(provider(), &config(20));
    let stage_a = pipeline.run_stage_a(&corpus).await.unwrap();

    let garden = stage_a.cluster(&ClusterId::from_label(3)).unwrap();
    assert!(pipeline.resplit(&corpus, garden, None).await.unwrap().is_none());

    let noise = stage_a.cluster(&ClusterId::noise()).unwrap();
    assert!(matches!(
        pipeline.resplit(&corpus, noise, None).await,
        Err(AppError::Validation(_))
    ));
}

#[tokio::test]
async fn test_pipeline_rejects_mismatched_cache() {
    let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let cache = EmbeddingCacheHandle::spawn("other-round", store, Arc::new(provider()), Default::default());
    let result = Pipeline::new(&config(1_000), cache, ClusteringEngine::default());
    assert!(matches!(result, Err(AppError::Config(_))));
}
