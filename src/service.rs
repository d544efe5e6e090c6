//! The command surface: one method per operation exposed to the CLI.
//!
//! [`MemoryService`] owns the open [`Store`], the [`EmbeddingService`] and the
//! markdown mirror location, and keeps the three in step: every mutating
//! operation updates the store, refreshes the embedding when the text
//! changed, and rewrites the export file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::MemkeepConfig;
use crate::db::{migrations, BackendReport, Store};
use crate::embedding::{memory_to_text, EmbeddingService};
use crate::error::StoreError;
use crate::memory::export::{
    archive_export, ensure_layout, export_memory, rebuild_from_exports, remove_export, RebuildReport,
};
use crate::memory::search::{hybrid_search, quick_search, SearchResponse};
use crate::memory::stats::{get_stats, StatsResponse};
use crate::memory::store::{
    create_memory, delete_memory, get_archive_candidates, get_memory, list_memories, load_memory,
    store_embedding, update_memory,
};
use crate::memory::types::{Category, Importance, Link, LinkType, ListFilter, Memory, MemoryUpdate, NewMemory};
use crate::memory::relations;

/// Picks a category for a memory written without one.
pub trait Categorizer: Send + Sync {
    fn categorize(&self, title: &str, summary: &str, content: &str) -> Category;
}

/// Files everything under `patterns`.
pub struct DefaultCategorizer;

impl Categorizer for DefaultCategorizer {
    fn categorize(&self, _title: &str, _summary: &str, _content: &str) -> Category {
        Category::default()
    }
}

/// Input of `write`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WriteRequest {
    pub title: String,
    pub summary: String,
    pub content: Option<String>,
    pub category: Option<Category>,
    pub scope: Option<String>,
    pub importance: Option<Importance>,
    pub tags: Vec<String>,
    pub supersedes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub memory_root: String,
    #[serde(flatten)]
    pub backend: BackendReport,
}

#[derive(Debug, Serialize)]
pub struct DeleteReport {
    pub id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct ExportReport {
    pub exported: usize,
    pub memory_root: String,
}

pub struct MemoryService {
    config: MemkeepConfig,
    store: Store,
    embeddings: Arc<EmbeddingService>,
    categorizer: Box<dyn Categorizer>,
}

impl MemoryService {
    /// Open the store and embedding service described by `config`.
    pub fn open(config: MemkeepConfig) -> Result<Self> {
        let store = Store::open(&config)?;
        let embeddings = Arc::new(EmbeddingService::from_config(&config.embedding));
        Ok(Self::with_parts(config, store, embeddings))
    }

    pub fn with_parts(config: MemkeepConfig, store: Store, embeddings: Arc<EmbeddingService>) -> Self {
        Self {
            config,
            store,
            embeddings,
            categorizer: Box::new(DefaultCategorizer),
        }
    }

    pub fn with_categorizer(mut self, categorizer: Box<dyn Categorizer>) -> Self {
        self.categorizer = categorizer;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &MemkeepConfig {
        &self.config
    }

    pub fn memory_root(&self) -> PathBuf {
        self.config.memory_root()
    }

    pub fn close(&self) -> Result<()> {
        Ok(self.store.close()?)
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Create the mirror layout and report the active backend. Safe to repeat.
    pub async fn init(&self) -> Result<InitReport> {
        let root = self.memory_root();
        ensure_layout(&root)?;
        Ok(InitReport {
            memory_root: root.display().to_string(),
            backend: self.backend().await?,
        })
    }

    pub async fn write(&self, request: WriteRequest) -> Result<Memory> {
        let title = request.title.trim();
        if title.is_empty() {
            bail!("title must not be empty");
        }
        let summary = request.summary.trim();
        let content = request
            .content
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(summary);
        let category = request
            .category
            .unwrap_or_else(|| self.categorizer.categorize(title, summary, content));

        let memory = create_memory(
            &self.store,
            &NewMemory {
                title: title.to_string(),
                summary: summary.to_string(),
                content: content.to_string(),
                category,
                scope: request.scope.clone().unwrap_or_default(),
                importance: request.importance.unwrap_or_default(),
                tags: request.tags.clone(),
                supersedes: request.supersedes.clone(),
                ..Default::default()
            },
        )?;

        self.embed(&memory).await?;
        self.export(&memory.id)?;
        self.reload(&memory.id)
    }

    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<SearchResponse> {
        Ok(hybrid_search(&self.store, &self.embeddings, query, limit, &self.config.search).await?)
    }

    pub fn quick(&self, query: &str, limit: Option<usize>) -> Result<SearchResponse> {
        Ok(quick_search(&self.store, query, limit, &self.config.search)?)
    }

    /// Fetch a memory, counting the access.
    pub fn get(&self, id: &str) -> Result<Memory> {
        Ok(get_memory(&self.store, id)?.ok_or_else(|| StoreError::not_found(id))?)
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Memory>> {
        Ok(list_memories(&self.store, filter)?)
    }

    pub fn stats(&self) -> Result<StatsResponse> {
        Ok(get_stats(&self.store)?)
    }

    /// Active backend and whether the store runs degraded. Loads the model to find out.
    pub async fn backend(&self) -> Result<BackendReport> {
        let available = self.embeddings.ensure_loaded().await;
        Ok(self.store.report(available)?)
    }

    /// Apply `update`. Blank content falls back to the summary, as in `write`.
    pub async fn update(&self, id: &str, mut update: MemoryUpdate) -> Result<Memory> {
        if update.is_empty() {
            bail!("nothing to update");
        }
        if let Some(title) = update.title.take() {
            let title = title.trim();
            if title.is_empty() {
                bail!("title must not be empty");
            }
            update.title = Some(title.to_string());
        }
        update.summary = update.summary.map(|s| s.trim().to_string());
        if let Some(content) = update.content.take() {
            let content = content.trim();
            update.content = Some(if content.is_empty() {
                match &update.summary {
                    Some(summary) => summary.clone(),
                    None => self.reload(id)?.summary,
                }
            } else {
                content.to_string()
            });
        }
        let memory = update_memory(&self.store, id, &update)?;
        if update.affects_content() {
            self.embed(&memory).await?;
        }
        self.export(id)?;
        self.reload(id)
    }

    pub fn link(&self, source: &str, target: &str, link_type: LinkType) -> Result<Link> {
        let link = relations::add_link(&self.store, source, target, link_type)?;
        self.export(source)?;
        Ok(link)
    }

    pub fn archive(&self, id: &str) -> Result<Memory> {
        archive_export(&self.store, &self.memory_root(), id)?;
        self.reload(id)
    }

    pub fn delete(&self, id: &str) -> Result<DeleteReport> {
        let memory = load_memory(&self.store, id)?.ok_or_else(|| StoreError::not_found(id))?;
        remove_export(&self.memory_root(), &memory)?;
        let deleted = delete_memory(&self.store, id)?;
        Ok(DeleteReport {
            id: id.to_string(),
            deleted,
        })
    }

    pub fn candidates(&self) -> Result<Vec<Memory>> {
        Ok(get_archive_candidates(&self.store)?)
    }

    /// Rewrite the export file of every memory, archived ones included.
    pub fn export_all(&self) -> Result<ExportReport> {
        let memories = list_memories(
            &self.store,
            &ListFilter {
                include_archived: true,
                ..Default::default()
            },
        )?;
        for memory in &memories {
            self.export(&memory.id)?;
        }
        Ok(ExportReport {
            exported: memories.len(),
            memory_root: self.memory_root().display().to_string(),
        })
    }

    /// Import every export file, then embed what was imported.
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let report = rebuild_from_exports(&self.store, &self.memory_root())?;
        if self.embeddings.is_available() {
            for id in &report.imported {
                if let Some(memory) = load_memory(&self.store, id)? {
                    self.embed(&memory).await?;
                }
            }
        }
        Ok(report)
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn reload(&self, id: &str) -> Result<Memory> {
        Ok(load_memory(&self.store, id)?.ok_or_else(|| StoreError::not_found(id))?)
    }

    fn export(&self, id: &str) -> Result<PathBuf> {
        export_memory(&self.store, &self.memory_root(), id)
    }

    /// Store a fresh embedding of `memory` when embeddings are available.
    async fn embed(&self, memory: &Memory) -> Result<bool> {
        let Some(vector) = self.embeddings.generate_embedding(&memory_to_text(memory)).await else {
            return Ok(false);
        };
        store_embedding(&self.store, &memory.id, &vector)?;
        let backend = self.store.backend();
        if migrations::get_embedding_model(backend)?.is_none() && !self.embeddings.model().is_empty() {
            migrations::set_embedding_model(backend, self.embeddings.model())?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct KeywordCategorizer;

    impl Categorizer for KeywordCategorizer {
        fn categorize(&self, title: &str, _summary: &str, _content: &str) -> Category {
            if title.to_lowercase().contains("bug") {
                Category::Issues
            } else {
                Category::Patterns
            }
        }
    }

    fn service(tmp: &TempDir) -> MemoryService {
        let config = MemkeepConfig::for_root(tmp.path());
        let store = Store::open(&config).unwrap();
        MemoryService::with_parts(config, store, Arc::new(EmbeddingService::disabled()))
    }

    #[tokio::test]
    async fn write_trims_and_defaults_content() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let m = svc
            .write(WriteRequest {
                title: "  JWT Authentication ".into(),
                summary: " Use 15-min access tokens ".into(),
                tags: vec!["auth".into(), "jwt".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(m.title, "JWT Authentication");
        assert_eq!(m.content, "Use 15-min access tokens");
        assert_eq!(m.category, Category::Patterns);
        let path = svc.memory_root().join(m.export_path.unwrap());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn empty_title_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        assert!(svc.write(WriteRequest::default()).await.is_err());
    }

    #[tokio::test]
    async fn categorizer_is_used_when_category_missing() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp).with_categorizer(Box::new(KeywordCategorizer));
        let m = svc
            .write(WriteRequest {
                title: "Login bug".into(),
                summary: "Session dropped".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(m.category, Category::Issues);
    }

    #[tokio::test]
    async fn update_reexports_and_delete_removes_file() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let m = svc
            .write(WriteRequest {
                title: "Retry policy".into(),
                summary: "Linear backoff".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let updated = svc
            .update(
                &m.id,
                MemoryUpdate {
                    category: Some(Category::Architecture),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let path = svc.memory_root().join(updated.export_path.clone().unwrap());
        assert!(path.starts_with(svc.memory_root().join("exports").join("architecture")));
        assert!(path.exists());

        let report = svc.delete(&m.id).unwrap();
        assert!(report.deleted);
        assert!(!path.exists());
        assert!(svc.get(&m.id).is_err());
    }

    #[tokio::test]
    async fn update_with_blank_content_falls_back_to_summary() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let m = svc
            .write(WriteRequest {
                title: "Cache".into(),
                summary: "Evict on write".into(),
                content: Some("Long form notes".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let updated = svc
            .update(
                &m.id,
                MemoryUpdate {
                    content: Some("  ".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.content, "Evict on write");

        let updated = svc
            .update(
                &m.id,
                MemoryUpdate {
                    summary: Some(" Evict on read ".into()),
                    content: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.summary, "Evict on read");
        assert_eq!(updated.content, "Evict on read");
    }

    #[tokio::test]
    async fn backend_reports_degraded_without_embeddings() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let report = svc.init().await.unwrap();
        assert!(report.backend.degraded);
        assert!(!report.backend.embeddings_available);
        assert!(svc.memory_root().join("archive").is_dir());
    }
}
