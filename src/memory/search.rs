//! Hybrid search: FTS5 keyword ranking fused with embedding similarity.
//!
//! [`hybrid_search`] parses the query, runs the keyword leg (on the blocking
//! pool) and the semantic leg concurrently, then merges by weighted score.
//! A memory id in the query switches to similar-to mode. [`quick_search`] is
//! the synchronous keyword-only variant. Searching never bumps access counts.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::SearchConfig;
use crate::db::backend::{Params, SqlValue};
use crate::db::Store;
use crate::embedding::{find_similar, memory_to_text, EmbeddingService};
use crate::error::{StoreError, StoreResult};
use crate::memory::query::{fts_match_expression, parse_query, ParsedQuery};
use crate::memory::store::{fetch_memories, get_all_embeddings, get_embedding, load_memory};
use crate::memory::types::{Category, Importance, Memory};

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Keyword and semantic legs merged.
    Hybrid,
    /// Ranked by similarity to an existing memory.
    Similar,
    /// Keyword leg only, no embedding call.
    Quick,
}

/// A single ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub category: Category,
    pub importance: Importance,
    pub scope: String,
    pub created_at: String,
    pub access_count: u32,
    pub archived: bool,
    pub tags: Vec<String>,
    pub keyword_score: f64,
    pub semantic_score: f64,
    pub relevance_score: f64,
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<SearchResult>,
    /// Matches after filtering, before truncation to the limit.
    pub total_matched: usize,
    pub embeddings_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Search in hybrid mode, or in similar-to mode when the query names a memory id.
pub async fn hybrid_search(
    store: &Store,
    embeddings: &EmbeddingService,
    query: &str,
    limit: Option<usize>,
    config: &SearchConfig,
) -> StoreResult<SearchResponse> {
    let parsed = parse_query(query);
    let limit = limit.unwrap_or(config.default_limit).max(1);

    if let Some(source_id) = parsed.similar_to.clone() {
        return similar_search(store, embeddings, query, &source_id, &parsed, limit, config).await;
    }

    let candidates = candidate_limit(limit, config);
    let keyword_leg = {
        let store = store.clone();
        let parsed = parsed.clone();
        let floor = config.keyword_fallback_floor;
        async move {
            tokio::task::spawn_blocking(move || keyword_search(&store, &parsed, floor, candidates))
                .await
                .map_err(join_error)?
        }
    };
    let semantic_leg = semantic_search(store, embeddings, &parsed, config);

    let (keyword, semantic) = tokio::join!(keyword_leg, semantic_leg);
    let keyword = keyword?;
    let semantic = semantic?;
    tracing::debug!(keyword = keyword.len(), semantic = semantic.len(), "search legs finished");

    let (results, total_matched) = merge(store, &parsed, &keyword, &semantic, limit, config)?;
    Ok(SearchResponse {
        query: query.to_string(),
        mode: SearchMode::Hybrid,
        results,
        total_matched,
        embeddings_available: embeddings.is_available(),
        note: None,
    })
}

/// Keyword-only search. Never calls the embedding model.
pub fn quick_search(
    store: &Store,
    query: &str,
    limit: Option<usize>,
    config: &SearchConfig,
) -> StoreResult<SearchResponse> {
    let parsed = parse_query(query);
    let limit = limit.unwrap_or(config.default_limit).max(1);
    let keyword = keyword_search(
        store,
        &parsed,
        config.keyword_fallback_floor,
        candidate_limit(limit, config),
    )?;
    let (results, total_matched) = merge(store, &parsed, &keyword, &[], limit, config)?;
    Ok(SearchResponse {
        query: query.to_string(),
        mode: SearchMode::Quick,
        results,
        total_matched,
        embeddings_available: false,
        note: None,
    })
}

/// Query-independent score from importance, access count and archive state.
pub fn relevance_score(memory: &Memory, config: &SearchConfig) -> f64 {
    let mut score = 0.5;
    match memory.importance {
        Importance::High => score += config.high_importance_boost,
        Importance::Low => score -= config.low_importance_penalty,
        Importance::Medium => {}
    }
    let access = (f64::from(memory.access_count) + 1.0).ln() / 101f64.ln();
    score += config.access_boost_cap * access.min(1.0);
    if memory.archived {
        score -= config.archived_penalty;
    }
    score.clamp(0.0, 1.0)
}

// ── Keyword leg ───────────────────────────────────────────────────────────────

fn candidate_limit(limit: usize, config: &SearchConfig) -> usize {
    (limit * 5).max(config.semantic_top_k).max(50)
}

/// SQL conditions for the archive, category, importance and tag filters.
///
/// Applied before the candidate `LIMIT`, so a filtered query never loses
/// matches to unfiltered rows ranked ahead of them.
fn filter_sql(parsed: &ParsedQuery) -> (String, Vec<SqlValue>) {
    let mut sql = String::new();
    let mut params = Vec::new();
    if !parsed.include_archived {
        sql.push_str(" AND m.archived = 0");
    }
    if let Some(category) = parsed.category {
        sql.push_str(" AND m.category = ?");
        params.push(category.as_str().into());
    }
    if let Some(importance) = parsed.importance {
        sql.push_str(" AND m.importance = ?");
        params.push(importance.as_str().into());
    }
    for tag in &parsed.tags {
        sql.push_str(" AND EXISTS (SELECT 1 FROM memory_tags t WHERE t.memory_id = m.id AND t.tag = ?)");
        params.push(tag.as_str().into());
    }
    (sql, params)
}

/// Score by rank position, best first, never below `floor`.
fn positional_scores(ids: Vec<String>, floor: f64) -> Vec<(String, f64)> {
    let n = ids.len().max(1) as f64;
    ids.into_iter()
        .enumerate()
        .map(|(i, id)| (id, (1.0 - i as f64 / n).max(floor)))
        .collect()
}

/// Keyword leg. Falls back to substring matching when the MATCH query fails.
pub fn keyword_search(
    store: &Store,
    parsed: &ParsedQuery,
    floor: f64,
    limit: usize,
) -> StoreResult<Vec<(String, f64)>> {
    let (filters, filter_params) = filter_sql(parsed);

    let Some(expr) = fts_match_expression(parsed) else {
        // Filters only: list matching memories, most used first.
        let mut params = filter_params;
        params.push(limit.into());
        let rows = store.all(
            &format!(
                "SELECT m.id FROM memories m WHERE 1 = 1{filters} \
                 ORDER BY m.access_count DESC, m.created_at DESC LIMIT ?"
            ),
            &Params::Positional(params),
        )?;
        let ids = rows.iter().map(|r| r.get_str("id")).collect::<StoreResult<Vec<_>>>()?;
        return Ok(positional_scores(ids, floor));
    };

    let mut params: Vec<SqlValue> = vec![expr.into()];
    params.extend(filter_params.iter().cloned());
    params.push(limit.into());
    let ranked = store.all(
        &format!(
            "SELECT memories_fts.id AS id, bm25(memories_fts) AS bm25_score \
             FROM memories_fts JOIN memories m ON m.id = memories_fts.id \
             WHERE memories_fts MATCH ?{filters} ORDER BY bm25_score LIMIT ?"
        ),
        &Params::Positional(params),
    );

    match ranked {
        Ok(rows) => {
            let mut hits = Vec::with_capacity(rows.len());
            for row in &rows {
                hits.push((row.get_str("id")?, row.get_f64("bm25_score")?.abs()));
            }
            let best = hits.iter().map(|(_, r)| *r).fold(0.0, f64::max);
            Ok(hits
                .into_iter()
                .map(|(id, r)| (id, if best > 0.0 { r / best } else { 1.0 }))
                .collect())
        }
        Err(e) if e.is_busy() => Err(e),
        Err(e) => {
            tracing::debug!(error = %e, "FTS query failed, falling back to substring search");
            like_search(store, parsed, &filters, filter_params, floor, limit)
        }
    }
}

fn like_search(
    store: &Store,
    parsed: &ParsedQuery,
    filters: &str,
    filter_params: Vec<SqlValue>,
    floor: f64,
    limit: usize,
) -> StoreResult<Vec<(String, f64)>> {
    let needles: Vec<&String> = parsed.phrases.iter().chain(parsed.terms.iter()).collect();
    let mut clauses = Vec::with_capacity(needles.len());
    let mut params: Vec<SqlValue> = Vec::new();
    for needle in needles {
        clauses.push(
            "(m.title LIKE ? ESCAPE '\\' OR m.summary LIKE ? ESCAPE '\\' OR m.content LIKE ? ESCAPE '\\')",
        );
        let pattern = format!("%{}%", escape_like(needle));
        for _ in 0..3 {
            params.push(pattern.as_str().into());
        }
    }
    params.extend(filter_params);
    params.push(limit.into());

    let rows = store.all(
        &format!(
            "SELECT m.id FROM memories m WHERE ({}){filters} \
             ORDER BY m.access_count DESC, m.created_at DESC LIMIT ?",
            clauses.join(" OR ")
        ),
        &Params::Positional(params),
    )?;
    let ids = rows.iter().map(|r| r.get_str("id")).collect::<StoreResult<Vec<_>>>()?;
    Ok(positional_scores(ids, floor))
}

/// Escape LIKE wildcards. LIKE is already case-insensitive for ASCII.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ── Semantic leg ──────────────────────────────────────────────────────────────

async fn semantic_search(
    store: &Store,
    embeddings: &EmbeddingService,
    parsed: &ParsedQuery,
    config: &SearchConfig,
) -> StoreResult<Vec<(String, f64)>> {
    if !parsed.has_text() || !embeddings.is_available() {
        return Ok(Vec::new());
    }
    let text = parsed
        .phrases
        .iter()
        .chain(parsed.terms.iter())
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");
    let Some(query_vec) = embeddings.generate_embedding(&text).await else {
        return Ok(Vec::new());
    };

    let candidates = load_embeddings(store, parsed.include_archived).await?;
    Ok(find_similar(&query_vec, &candidates, config.semantic_top_k, config.min_similarity)
        .into_iter()
        .map(|(id, s)| (id, f64::from(s).clamp(0.0, 1.0)))
        .collect())
}

async fn load_embeddings(store: &Store, include_archived: bool) -> StoreResult<Vec<(String, Vec<f32>)>> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || get_all_embeddings(&store, include_archived))
        .await
        .map_err(join_error)?
}

async fn similar_search(
    store: &Store,
    embeddings: &EmbeddingService,
    query: &str,
    source_id: &str,
    parsed: &ParsedQuery,
    limit: usize,
    config: &SearchConfig,
) -> StoreResult<SearchResponse> {
    let respond = |results: Vec<SearchResult>, total_matched: usize, note: Option<String>| SearchResponse {
        query: query.to_string(),
        mode: SearchMode::Similar,
        results,
        total_matched,
        embeddings_available: embeddings.is_available(),
        note,
    };

    let Some(source) = load_memory(store, source_id)? else {
        return Ok(respond(Vec::new(), 0, Some(format!("memory not found: {source_id}"))));
    };

    let query_vec = match embeddings.generate_embedding(&memory_to_text(&source)).await {
        Some(v) => Some(v),
        None => get_embedding(store, source_id)?,
    };
    let Some(query_vec) = query_vec else {
        return Ok(respond(
            Vec::new(),
            0,
            Some("embeddings unavailable; similar-to search needs a stored or generated embedding".into()),
        ));
    };

    let candidates: Vec<(String, Vec<f32>)> = load_embeddings(store, parsed.include_archived)
        .await?
        .into_iter()
        .filter(|(id, _)| id != source_id)
        .collect();
    let top_k = candidate_limit(limit, config);
    let scored = find_similar(&query_vec, &candidates, top_k, config.min_similarity);

    let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
    let by_id: HashMap<String, Memory> = fetch_memories(store, &ids)?
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect();

    let mut results: Vec<SearchResult> = scored
        .into_iter()
        .filter_map(|(id, s)| {
            let memory = by_id.get(&id)?;
            if !passes_filters(memory, parsed) {
                return None;
            }
            let s = f64::from(s).clamp(0.0, 1.0);
            Some(to_result(memory, 0.0, s, 0.0, s))
        })
        .collect();
    let total = results.len();
    results.truncate(limit);
    Ok(respond(results, total, None))
}

// ── Merge ─────────────────────────────────────────────────────────────────────

fn passes_filters(memory: &Memory, parsed: &ParsedQuery) -> bool {
    (parsed.include_archived || !memory.archived)
        && parsed.category.is_none_or(|c| memory.category == c)
        && parsed.importance.is_none_or(|i| memory.importance == i)
        && parsed.tags.iter().all(|t| memory.tags.contains(t))
}

fn to_result(memory: &Memory, keyword: f64, semantic: f64, relevance: f64, score: f64) -> SearchResult {
    SearchResult {
        id: memory.id.clone(),
        title: memory.title.clone(),
        summary: memory.summary.clone(),
        category: memory.category,
        importance: memory.importance,
        scope: memory.scope.clone(),
        created_at: memory.created_at.clone(),
        access_count: memory.access_count,
        archived: memory.archived,
        tags: memory.tags.clone(),
        keyword_score: keyword,
        semantic_score: semantic,
        relevance_score: relevance,
        score,
    }
}

/// Union both legs, score, filter, sort and truncate. Returns results and the
/// number of matches before truncation.
fn merge(
    store: &Store,
    parsed: &ParsedQuery,
    keyword: &[(String, f64)],
    semantic: &[(String, f64)],
    limit: usize,
    config: &SearchConfig,
) -> StoreResult<(Vec<SearchResult>, usize)> {
    let mut legs: HashMap<&str, (f64, f64)> = HashMap::new();
    for (id, k) in keyword {
        legs.entry(id.as_str()).or_default().0 = *k;
    }
    for (id, s) in semantic {
        legs.entry(id.as_str()).or_default().1 = *s;
    }

    let ids: Vec<String> = legs.keys().map(|id| id.to_string()).collect();
    let memories = fetch_memories(store, &ids)?;

    let mut results: Vec<SearchResult> = memories
        .iter()
        .filter(|m| passes_filters(m, parsed))
        .filter_map(|m| {
            let (k, s) = *legs.get(m.id.as_str())?;
            let r = relevance_score(m, config);
            let score = config.keyword_weight * k + config.semantic_weight * s + config.relevance_weight * r;
            Some(to_result(m, k, s, r, score))
        })
        .collect();

    results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    let total = results.len();
    results.truncate(limit);
    Ok((results, total))
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::backend(format!("search task failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::{create_memory, set_archived};
    use crate::memory::types::NewMemory;

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        for (title, summary, category, importance, tags) in [
            ("JWT Authentication", "Use 15-min access tokens", Category::Architecture, Importance::High, vec!["auth", "jwt"]),
            ("Connection pooling", "Reuse database connections", Category::Implementation, Importance::Medium, vec!["db"]),
            ("Token refresh bug", "Refresh tokens expired early", Category::Issues, Importance::Low, vec!["auth"]),
            ("Layered services", "Keep handlers thin", Category::Architecture, Importance::Medium, vec!["design"]),
        ] {
            create_memory(
                &store,
                &NewMemory {
                    title: title.into(),
                    summary: summary.into(),
                    content: summary.into(),
                    category,
                    importance,
                    tags: tags.into_iter().map(String::from).collect(),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        store
    }

    #[test]
    fn quick_search_finds_keyword() {
        let store = seeded();
        let resp = quick_search(&store, "jwt", None, &SearchConfig::default()).unwrap();
        assert_eq!(resp.mode, SearchMode::Quick);
        assert_eq!(resp.results[0].id, "mem-001");
        assert!((resp.results[0].keyword_score - 1.0).abs() < 1e-9);
        assert_eq!(resp.results[0].semantic_score, 0.0);
    }

    #[test]
    fn filter_only_query() {
        let store = seeded();
        let resp = quick_search(&store, "category:architecture importance:high", None, &SearchConfig::default()).unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].category, Category::Architecture);
        assert_eq!(resp.results[0].importance, Importance::High);
    }

    #[test]
    fn tag_filter_is_conjunctive() {
        let store = seeded();
        let resp = quick_search(&store, "tag:auth tag:jwt", None, &SearchConfig::default()).unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].id, "mem-001");

        let auth = quick_search(&store, "tag:auth", None, &SearchConfig::default()).unwrap();
        assert_eq!(auth.results.len(), 2);
    }

    #[test]
    fn archived_excluded_unless_requested() {
        let store = seeded();
        set_archived(&store, "mem-002", true, None).unwrap();
        let config = SearchConfig::default();
        assert!(quick_search(&store, "pooling", None, &config).unwrap().results.is_empty());
        let with = quick_search(&store, "pooling --include-archive", None, &config).unwrap();
        assert_eq!(with.results.len(), 1);
        assert!(with.results[0].archived);
    }

    #[test]
    fn fallback_matches_substrings() {
        let store = seeded();
        let parsed = parse_query("pool");
        let (filters, params) = filter_sql(&parsed);
        let hits = like_search(&store, &parsed, &filters, params, 0.2, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "mem-002");
        assert!((hits[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn positional_scores_have_floor() {
        let ids = (0..10).map(|i| i.to_string()).collect();
        let scores = positional_scores(ids, 0.2);
        assert!((scores[0].1 - 1.0).abs() < 1e-9);
        assert!(scores.iter().all(|(_, s)| *s >= 0.2));
    }

    #[test]
    fn relevance_components() {
        let store = seeded();
        let config = SearchConfig::default();
        let high = load_memory(&store, "mem-001").unwrap().unwrap();
        let low = load_memory(&store, "mem-003").unwrap().unwrap();
        assert!((relevance_score(&high, &config) - 0.8).abs() < 1e-9);
        assert!((relevance_score(&low, &config) - 0.3).abs() < 1e-9);

        let mut busy = high.clone();
        busy.access_count = 100;
        assert!((relevance_score(&busy, &config) - 1.0).abs() < 1e-9);

        let mut archived = low;
        archived.archived = true;
        assert!(relevance_score(&archived, &config).abs() < 1e-9);
    }

    #[test]
    fn merge_keeps_single_leg_results() {
        let store = seeded();
        let config = SearchConfig::default();
        let keyword = vec![("mem-001".to_string(), 1.0)];
        let semantic = vec![("mem-004".to_string(), 0.9)];
        let (results, total) = merge(&store, &parse_query("x"), &keyword, &semantic, 10, &config).unwrap();
        assert_eq!(total, 2);
        for r in &results {
            let expected = 0.4 * r.keyword_score + 0.4 * r.semantic_score + 0.2 * r.relevance_score;
            assert!((r.score - expected).abs() < 1e-9);
        }
        let only_kw = results.iter().find(|r| r.id == "mem-001").unwrap();
        assert_eq!(only_kw.semantic_score, 0.0);
        let only_sem = results.iter().find(|r| r.id == "mem-004").unwrap();
        assert_eq!(only_sem.keyword_score, 0.0);
    }

    #[tokio::test]
    async fn hybrid_without_embeddings_still_ranks() {
        let store = seeded();
        let resp = hybrid_search(&store, &EmbeddingService::disabled(), "tokens", None, &SearchConfig::default())
            .await
            .unwrap();
        assert_eq!(resp.mode, SearchMode::Hybrid);
        assert!(!resp.embeddings_available);
        let ids: Vec<&str> = resp.results.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"mem-001"));
        assert!(ids.contains(&"mem-003"));
    }

    #[tokio::test]
    async fn similar_to_missing_memory_is_empty() {
        let store = seeded();
        let resp = hybrid_search(&store, &EmbeddingService::disabled(), "mem-999", None, &SearchConfig::default())
            .await
            .unwrap();
        assert_eq!(resp.mode, SearchMode::Similar);
        assert!(resp.results.is_empty());
        assert!(resp.note.is_some());
    }
}
