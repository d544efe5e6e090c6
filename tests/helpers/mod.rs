#![allow(dead_code)]

use std::sync::Arc;

use memkeep::config::MemkeepConfig;
use memkeep::db::Store;
use memkeep::embedding::{EmbeddingProvider, EmbeddingService, EMBEDDING_DIM};
use memkeep::service::{MemoryService, WriteRequest};
use tempfile::TempDir;

/// Config rooted in `tmp`: native backend, embeddings off.
pub fn test_config(tmp: &TempDir) -> MemkeepConfig {
    let mut config = MemkeepConfig::for_root(tmp.path());
    config.storage.backend = "native".into();
    config.embedding.provider = "none".into();
    config
}

/// Fresh file-backed store with schema applied.
pub fn test_store(tmp: &TempDir) -> Store {
    Store::open(&test_config(tmp)).unwrap()
}

/// Service without embeddings (keyword search only).
pub fn test_service(tmp: &TempDir) -> MemoryService {
    service_with(tmp, Arc::new(EmbeddingService::disabled()))
}

/// Service whose embeddings come from [`WordHashProvider`].
pub fn embedded_service(tmp: &TempDir) -> MemoryService {
    service_with(
        tmp,
        Arc::new(EmbeddingService::with_provider(Arc::new(WordHashProvider), "word-hash")),
    )
}

pub fn service_with(tmp: &TempDir, embeddings: Arc<EmbeddingService>) -> MemoryService {
    let mut config = test_config(tmp);
    // Word-hash vectors are sparse; keep every overlap.
    config.search.min_similarity = 0.05;
    let store = Store::open(&config).unwrap();
    MemoryService::with_parts(config, store, embeddings)
}

pub fn request(title: &str, summary: &str, tags: &[&str]) -> WriteRequest {
    WriteRequest {
        title: title.to_string(),
        summary: summary.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

/// Generate a deterministic 384-dim embedding with a spike at position `seed`.
pub fn test_embedding(seed: u16) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[seed as usize % EMBEDDING_DIM] = 1.0;
    v
}

/// Bag-of-words embedding: every lowercase word adds 1.0 at an FNV-1a slot.
/// Texts that share words are close; disjoint texts are (nearly) orthogonal.
pub struct WordHashProvider;

impl EmbeddingProvider for WordHashProvider {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            v[fnv1a(&word.to_lowercase()) as usize % EMBEDDING_DIM] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

/// Always fails, as a missing or broken model would.
pub struct FailingProvider;

impl EmbeddingProvider for FailingProvider {
    fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("model exploded")
    }
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf29ce484222325, |h, b| (h ^ u64::from(b)).wrapping_mul(0x100000001b3))
}

pub fn sqlite3_available() -> bool {
    which::which("sqlite3").is_ok()
}
