mod helpers;

use std::sync::Arc;

use helpers::{embedded_service, request, service_with, test_service, FailingProvider};
use memkeep::embedding::EmbeddingService;
use memkeep::memory::search::SearchMode;
use memkeep::memory::types::{Category, Importance};
use memkeep::service::{MemoryService, WriteRequest};
use tempfile::TempDir;

async fn seed(svc: &MemoryService) {
    svc.write(WriteRequest {
        category: Some(Category::Architecture),
        importance: Some(Importance::High),
        ..request("JWT Authentication", "Use 15-min access tokens with refresh rotation", &["auth", "jwt"])
    })
    .await
    .unwrap();
    svc.write(WriteRequest {
        category: Some(Category::Architecture),
        ..request("Event bus", "Services publish domain events to a shared queue", &["events"])
    })
    .await
    .unwrap();
    svc.write(WriteRequest {
        category: Some(Category::Issues),
        ..request("Token refresh race", "Two tabs refresh access tokens at once", &["auth", "bug"])
    })
    .await
    .unwrap();
    svc.write(WriteRequest {
        importance: Some(Importance::Low),
        ..request("Builder pattern", "Prefer builders for structs with many optional fields", &["rust"])
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn keyword_query_ranks_exact_topic_first() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    seed(&svc).await;

    let response = svc.search("jwt", None).await.unwrap();
    assert_eq!(response.mode, SearchMode::Hybrid);
    assert!(!response.embeddings_available);
    assert_eq!(response.results[0].title, "JWT Authentication");
}

#[tokio::test]
async fn filter_only_query_returns_matching_memories() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    seed(&svc).await;

    let response = svc.search("category:architecture importance:high", None).await.unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, "mem-001");

    let response = svc.quick("category:architecture", None).unwrap();
    assert_eq!(response.results.len(), 2);
    assert!(response.results.iter().all(|r| r.category == Category::Architecture));
}

#[tokio::test]
async fn tag_filters_are_conjunctive() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    seed(&svc).await;

    let response = svc.quick("tag:auth", None).unwrap();
    assert_eq!(response.results.len(), 2);

    let response = svc.quick("tag:auth tag:bug", None).unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].title, "Token refresh race");
}

#[tokio::test]
async fn archived_memories_need_the_flag() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    seed(&svc).await;
    svc.archive("mem-003").unwrap();

    let response = svc.quick("tokens", None).unwrap();
    assert!(response.results.iter().all(|r| r.id != "mem-003"));

    let response = svc.quick("tokens --include-archive", None).unwrap();
    let archived = response.results.iter().find(|r| r.id == "mem-003").unwrap();
    assert!(archived.archived);
}

#[tokio::test]
async fn limit_truncates_but_reports_total() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    seed(&svc).await;

    let response = svc.quick("tag:auth", Some(1)).unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.total_matched, 2);
}

#[tokio::test]
async fn hybrid_scores_follow_the_weighted_formula() {
    let tmp = TempDir::new().unwrap();
    let svc = embedded_service(&tmp);
    seed(&svc).await;

    let response = svc.search("access tokens", None).await.unwrap();
    assert!(response.embeddings_available);
    assert!(!response.results.is_empty());
    assert!(response.results.iter().any(|r| r.semantic_score > 0.0));

    let weights = &svc.config().search;
    for r in &response.results {
        let expected = weights.keyword_weight * r.keyword_score
            + weights.semantic_weight * r.semantic_score
            + weights.relevance_weight * r.relevance_score;
        assert!((r.score - expected).abs() < 1e-9, "{}: {} != {}", r.id, r.score, expected);
    }
    for pair in response.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn similar_to_excludes_the_source() {
    let tmp = TempDir::new().unwrap();
    let svc = embedded_service(&tmp);
    seed(&svc).await;

    let response = svc.search("similar to mem-001", None).await.unwrap();
    assert_eq!(response.mode, SearchMode::Similar);
    assert!(response.results.iter().all(|r| r.id != "mem-001"));
    // Shares "access", "tokens", "refresh" and the auth tag with the source.
    assert_eq!(response.results[0].id, "mem-003");
    assert_eq!(response.results[0].keyword_score, 0.0);
    assert_eq!(response.results[0].score, response.results[0].semantic_score);
}

#[tokio::test]
async fn similar_to_unknown_id_is_empty_with_note() {
    let tmp = TempDir::new().unwrap();
    let svc = embedded_service(&tmp);
    seed(&svc).await;

    let response = svc.search("similar to mem-999", None).await.unwrap();
    assert!(response.results.is_empty());
    assert!(response.note.unwrap().contains("mem-999"));
}

#[tokio::test]
async fn broken_model_degrades_to_keyword_search() {
    let tmp = TempDir::new().unwrap();
    let svc = service_with(
        &tmp,
        Arc::new(EmbeddingService::with_provider(Arc::new(FailingProvider), "broken")),
    );
    seed(&svc).await;

    let response = svc.search("jwt", None).await.unwrap();
    assert!(!response.embeddings_available);
    assert_eq!(response.results[0].title, "JWT Authentication");
    assert_eq!(svc.stats().unwrap().embedding_count, 0);
}

#[tokio::test]
async fn writes_store_embeddings_when_available() {
    let tmp = TempDir::new().unwrap();
    let svc = embedded_service(&tmp);
    seed(&svc).await;

    assert_eq!(svc.stats().unwrap().embedding_count, 4);
    let report = svc.backend().await.unwrap();
    assert!(!report.degraded);
    assert_eq!(report.embedding_model.as_deref(), Some("word-hash"));
}

#[tokio::test]
async fn search_does_not_count_as_access() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    seed(&svc).await;

    svc.search("jwt", None).await.unwrap();
    svc.quick("jwt", None).unwrap();
    let stats = svc.stats().unwrap();
    assert!(stats.most_accessed.is_empty());
}

#[tokio::test]
async fn tag_filter_reaches_past_the_candidate_window() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let rare = svc.write(request("Rare note", "seldom used tokens", &["rare"])).await.unwrap();
    for i in 0..60 {
        let m = svc
            .write(request(&format!("Common note {i}"), "frequently used tokens", &["common"]))
            .await
            .unwrap();
        svc.get(&m.id).unwrap();
    }

    let quick = svc.quick("tag:rare", None).unwrap();
    assert_eq!(quick.results.len(), 1);
    assert_eq!(quick.results[0].id, rare.id);

    let hybrid = svc.search("tag:rare", None).await.unwrap();
    assert_eq!(hybrid.results.len(), 1);
    assert_eq!(hybrid.results[0].id, rare.id);

    let with_text = svc.quick("tokens tag:rare", None).unwrap();
    assert_eq!(with_text.results.len(), 1);
    assert_eq!(with_text.results[0].id, rare.id);
}
