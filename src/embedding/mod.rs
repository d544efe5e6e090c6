//! Text-to-vector embedding pipeline.
//!
//! [`EmbeddingProvider`] is the synchronous model interface; the ONNX
//! implementation lives in [`local`]. [`EmbeddingService`] wraps a provider
//! for async callers: the model is loaded lazily and at most once, inference
//! runs on the blocking pool, and the first failure marks embeddings
//! unavailable for the rest of the process so callers carry on without them.

pub mod local;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::OnceCell;

use crate::config::EmbeddingConfig;
use crate::memory::types::Memory;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Rough characters-per-token ratio used to pre-truncate input.
const CHARS_PER_TOKEN: usize = 4;

/// Trait for embedding text into vectors.
///
/// All methods are synchronous. Async callers go through [`EmbeddingService`],
/// which moves them onto `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Create an embedding provider from config.
///
/// Only `"local"` is supported (ONNX Runtime + all-MiniLM-L6-v2).
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(local::LocalEmbeddingProvider::new(config)?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, none"),
    }
}

type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync>;

/// Lazily loaded, failure-tolerant embedding front end.
pub struct EmbeddingService {
    factory: Option<ProviderFactory>,
    provider: OnceCell<Option<Arc<dyn EmbeddingProvider>>>,
    available: AtomicBool,
    max_chars: usize,
    model: String,
}

impl EmbeddingService {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        if matches!(config.provider.as_str(), "none" | "off" | "disabled") {
            tracing::debug!("embeddings disabled by configuration");
            return Self::disabled();
        }
        let cfg = config.clone();
        Self {
            factory: Some(Arc::new(move || create_provider(&cfg))),
            provider: OnceCell::new(),
            available: AtomicBool::new(true),
            max_chars: config.max_tokens.max(1) * CHARS_PER_TOKEN,
            model: config.model.clone(),
        }
    }

    /// A service that never produces embeddings.
    pub fn disabled() -> Self {
        Self {
            factory: None,
            provider: OnceCell::new_with(Some(None)),
            available: AtomicBool::new(false),
            max_chars: 0,
            model: String::new(),
        }
    }

    /// A service backed by an already-constructed provider.
    pub fn with_provider(provider: Arc<dyn EmbeddingProvider>, model: impl Into<String>) -> Self {
        Self {
            factory: None,
            provider: OnceCell::new_with(Some(Some(provider))),
            available: AtomicBool::new(true),
            max_chars: 256 * CHARS_PER_TOKEN,
            model: model.into(),
        }
    }

    /// False once loading or inference has failed, or when disabled.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Load the model if that has not been tried yet, and report availability.
    pub async fn ensure_loaded(&self) -> bool {
        self.provider().await.is_some()
    }

    fn mark_unavailable(&self, reason: &str) {
        if self.available.swap(false, Ordering::AcqRel) {
            tracing::warn!(reason, "embeddings unavailable, continuing with keyword search only");
        }
    }

    async fn provider(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        if !self.is_available() {
            return None;
        }
        let loaded = self
            .provider
            .get_or_init(|| async {
                let factory = self.factory.clone()?;
                match tokio::task::spawn_blocking(move || factory()).await {
                    Ok(Ok(provider)) => Some(provider),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "failed to load embedding model");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "embedding model load panicked");
                        None
                    }
                }
            })
            .await
            .clone();
        if loaded.is_none() {
            self.mark_unavailable("model load failed");
        }
        loaded
    }

    /// Embed `text`, or `None` when embeddings are unavailable or inference fails.
    pub async fn generate_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let provider = self.provider().await?;
        let text = truncate_chars(text, self.max_chars).to_string();
        match tokio::task::spawn_blocking(move || provider.embed(&text)).await {
            Ok(Ok(vector)) => Some(vector),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "embedding failed");
                self.mark_unavailable("inference failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding task panicked");
                self.mark_unavailable("inference panicked");
                None
            }
        }
    }

    /// Embed several texts. The result has one entry per input.
    pub async fn generate_embeddings(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let Some(provider) = self.provider().await else {
            return vec![None; texts.len()];
        };
        let owned: Vec<String> = texts
            .iter()
            .map(|t| truncate_chars(t, self.max_chars).to_string())
            .collect();
        let result = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
            provider.embed_batch(&refs)
        })
        .await;
        match result {
            Ok(Ok(vectors)) if vectors.len() == texts.len() => vectors.into_iter().map(Some).collect(),
            Ok(Ok(_)) => {
                self.mark_unavailable("batch size mismatch");
                vec![None; texts.len()]
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "batch embedding failed");
                self.mark_unavailable("inference failed");
                vec![None; texts.len()]
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding task panicked");
                self.mark_unavailable("inference panicked");
                vec![None; texts.len()]
            }
        }
    }
}

/// Longest prefix of `text` with at most `max_chars` characters.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Cosine similarity. Returns 0 for empty, mismatched or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Score every candidate against `query`, drop those below `min_score`,
/// and return the best `top_k` in descending order.
pub fn find_similar(
    query: &[f32],
    candidates: &[(String, Vec<f32>)],
    top_k: usize,
    min_score: f32,
) -> Vec<(String, f32)> {
    let mut scored: Vec<(String, f32)> = candidates
        .iter()
        .map(|(id, v)| (id.clone(), cosine_similarity(query, v)))
        .filter(|(_, s)| *s >= min_score)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(top_k);
    scored
}

/// Canonical text of a memory, used both when storing its embedding and when
/// embedding it as a similar-to query.
pub fn memory_to_text(memory: &Memory) -> String {
    let mut parts: Vec<String> = [&memory.title, &memory.summary, &memory.content]
        .into_iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if !memory.tags.is_empty() {
        parts.push(format!("Tags: {}", memory.tags.join(", ")));
    }
    parts.push(format!("Category: {}", memory.category));
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Category, Importance};

    struct FailingProvider;

    impl EmbeddingProvider for FailingProvider {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            anyhow::bail!("boom")
        }
    }

    struct LengthProvider;

    impl EmbeddingProvider for LengthProvider {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.chars().count() as f32, 1.0])
        }
    }

    fn memory() -> Memory {
        Memory {
            id: "mem-001".into(),
            title: "JWT Authentication".into(),
            summary: "Use 15-min access tokens".into(),
            content: String::new(),
            category: Category::Architecture,
            scope: "project".into(),
            importance: Importance::High,
            created_at: "2026-01-01T00:00:00Z".into(),
            accessed_at: None,
            access_count: 0,
            supersedes: None,
            archived: false,
            export_path: None,
            tags: vec!["auth".into(), "jwt".into()],
            links: vec![],
        }
    }

    #[test]
    fn cosine_handles_edge_cases() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn find_similar_filters_and_orders() {
        let candidates = vec![
            ("a".to_string(), vec![1.0, 0.0]),
            ("b".to_string(), vec![0.0, 1.0]),
            ("c".to_string(), vec![1.0, 0.1]),
            ("d".to_string(), vec![1.0, 1.0]),
        ];
        let hits = find_similar(&[1.0, 0.0], &candidates, 2, 0.3);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "a");
        assert_eq!(hits[1].0, "c");
        assert!(hits.iter().all(|(id, _)| id != "b"));
    }

    #[test]
    fn memory_text_is_canonical() {
        let text = memory_to_text(&memory());
        assert_eq!(
            text,
            "JWT Authentication\n\nUse 15-min access tokens\n\nTags: auth, jwt\n\nCategory: architecture"
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[tokio::test]
    async fn disabled_service_returns_none() {
        let service = EmbeddingService::disabled();
        assert!(!service.is_available());
        assert!(service.generate_embedding("x").await.is_none());
        assert_eq!(service.generate_embeddings(&["a".into(), "b".into()]).await.len(), 2);
    }

    #[tokio::test]
    async fn failure_flips_availability() {
        let service = EmbeddingService::with_provider(Arc::new(FailingProvider), "failing");
        assert!(service.is_available());
        assert!(service.generate_embedding("x").await.is_none());
        assert!(!service.is_available());
    }

    #[tokio::test]
    async fn load_failure_flips_availability() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = EmbeddingConfig {
            cache_dir: tmp.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let service = EmbeddingService::from_config(&config);
        assert!(!service.ensure_loaded().await);
        assert!(!service.is_available());
    }

    #[tokio::test]
    async fn batch_is_elementwise() {
        let service = EmbeddingService::with_provider(Arc::new(LengthProvider), "len");
        let out = service
            .generate_embeddings(&["ab".into(), "abcd".into()])
            .await;
        assert_eq!(out[0].as_deref(), Some(&[2.0, 1.0][..]));
        assert_eq!(out[1].as_deref(), Some(&[4.0, 1.0][..]));
    }
}
