//! SQL DDL for all memkeep tables.
//!
//! Defines `memories`, the standalone `memories_fts` (FTS5) index, `memory_tags`,
//! `memory_links`, `memory_embeddings`, the `id_counter` allocator row and
//! `schema_meta`. All DDL uses `IF NOT EXISTS` for idempotent initialization.
//! The FTS table has no triggers; the memory write path rewrites it explicitly.

use crate::db::backend::Backend;
use crate::error::StoreResult;

/// All schema DDL statements.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT 'patterns',
    scope TEXT NOT NULL DEFAULT 'project',
    importance TEXT NOT NULL DEFAULT 'medium' CHECK(importance IN ('high','medium','low')),
    created_at TEXT NOT NULL,
    accessed_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    supersedes TEXT,
    archived INTEGER NOT NULL DEFAULT 0,
    export_path TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);
CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);
CREATE INDEX IF NOT EXISTS idx_memories_archived ON memories(archived);

-- Full-text search (BM25)
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    id UNINDEXED,
    title,
    summary,
    content,
    tags
);

CREATE TABLE IF NOT EXISTS memory_tags (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (memory_id, tag)
);

CREATE INDEX IF NOT EXISTS idx_tags_tag ON memory_tags(tag);

-- Target may be another memory or an external key, so no FK on target_id.
CREATE TABLE IF NOT EXISTS memory_links (
    source_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL,
    link_type TEXT NOT NULL DEFAULT 'related',
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id)
);

CREATE INDEX IF NOT EXISTS idx_links_target ON memory_links(target_id);

CREATE TABLE IF NOT EXISTS memory_embeddings (
    memory_id TEXT PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    vector BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS id_counter (
    name TEXT PRIMARY KEY,
    next_value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1');
"#;

/// Initialize all schema tables. Idempotent.
pub fn init_schema(backend: &dyn Backend) -> StoreResult<()> {
    backend.exec(SCHEMA_SQL)
}
