//! Memory CRUD: id allocation, create, read, update, delete, embeddings.
//!
//! Every function takes the [`Store`] handle explicitly. Statements go through
//! [`Store::run`]/[`Store::all`], so lock contention is retried and never
//! reaches the caller. The FTS index has no triggers: each function that
//! changes a memory or its tags calls [`sync_fts`] before returning.

use chrono::Utc;

use crate::db::backend::{Params, Row, SqlValue};
use crate::db::migrations::MEMORY_COUNTER;
use crate::db::Store;
use crate::error::{StoreError, StoreResult};
use crate::memory::types::{
    normalize_tags, Category, Importance, LinkType, ListFilter, Memory, MemoryUpdate, NewMemory,
};
use crate::memory::{
    bytes_to_embedding, embedding_to_bytes, format_id, parse_id_number, relations, ID_PREFIX,
    MAX_SEQUENTIAL_DIGITS,
};
use crate::sql_params;

/// Sequential allocations tried before falling back to a timestamp id.
const MAX_ID_ATTEMPTS: u32 = 5;

/// Column list shared by every memory query. Tags come back as a JSON array.
pub(crate) const MEMORY_SELECT: &str = "\
SELECT m.id, m.title, m.summary, m.content, m.category, m.scope, m.importance, \
       m.created_at, m.accessed_at, m.access_count, m.supersedes, m.archived, m.export_path, \
       (SELECT json_group_array(mt.tag) FROM memory_tags mt WHERE mt.memory_id = m.id) AS tags_json \
FROM memories m";

/// Build a [`Memory`] from a row selected with [`MEMORY_SELECT`]. Links are left empty.
pub(crate) fn memory_from_row(row: &Row) -> StoreResult<Memory> {
    let tags_json = row.get_opt_str("tags_json")?.unwrap_or_else(|| "[]".into());
    let raw_tags: Vec<Option<String>> = serde_json::from_str(&tags_json)?;
    let mut tags: Vec<String> = raw_tags.into_iter().flatten().collect();
    tags.sort();

    Ok(Memory {
        id: row.get_str("id")?,
        title: row.get_str("title")?,
        summary: row.get_opt_str("summary")?.unwrap_or_default(),
        content: row.get_opt_str("content")?.unwrap_or_default(),
        category: row
            .get_str("category")?
            .parse::<Category>()
            .map_err(StoreError::backend)?,
        scope: row.get_opt_str("scope")?.unwrap_or_else(|| "project".into()),
        importance: row
            .get_str("importance")?
            .parse::<Importance>()
            .map_err(StoreError::backend)?,
        created_at: row.get_str("created_at")?,
        accessed_at: row.get_opt_str("accessed_at")?,
        access_count: row.get_i64("access_count")?.max(0) as u32,
        supersedes: row.get_opt_str("supersedes")?,
        archived: row.get_bool("archived")?,
        export_path: row.get_opt_str("export_path")?,
        tags,
        links: Vec::new(),
    })
}

/// Rewrite the FTS row of `id` from the current record and tag set.
///
/// If the memory no longer exists the FTS row is simply removed.
pub fn sync_fts(store: &Store, id: &str) -> StoreResult<()> {
    store.run("DELETE FROM memories_fts WHERE id = ?", &sql_params![id])?;
    store.run(
        "INSERT INTO memories_fts (id, title, summary, content, tags) \
         SELECT m.id, m.title, m.summary, m.content, \
                COALESCE((SELECT group_concat(tag, ' ') FROM memory_tags WHERE memory_id = m.id), '') \
         FROM memories m WHERE m.id = ?",
        &sql_params![id],
    )?;
    Ok(())
}

/// Allocate the next sequential id.
///
/// Backends with per-call transactions bump the counter row and read it back
/// in one statement. The shell backend computes `max(existing) + 1` instead and
/// relies on [`create_memory`] retrying insert-time collisions.
pub fn allocate_id(store: &Store) -> StoreResult<String> {
    if store.backend().supports_transactions() {
        let row = store.get(
            "UPDATE id_counter SET next_value = next_value + 1 WHERE name = ? RETURNING next_value",
            &sql_params![MEMORY_COUNTER],
        )?;
        let next = match row {
            Some(row) => row.get_i64("next_value")?,
            None => {
                // Counter row missing (store created outside memkeep); seed it and retry.
                repair_id_counter(store, max_sequential_id(store)?.unwrap_or(0))?;
                return allocate_id(store);
            }
        };
        return Ok(format_id((next - 1).max(1) as u64));
    }

    let row = store.get(
        "SELECT MAX( \
           COALESCE((SELECT MAX(CAST(SUBSTR(id, 5) AS INTEGER)) FROM memories \
                     WHERE id GLOB 'mem-[0-9]*' AND LENGTH(id) <= ?), 0) + 1, \
           COALESCE((SELECT next_value FROM id_counter WHERE name = ?), 1)) AS next",
        &sql_params![ID_PREFIX.len() + MAX_SEQUENTIAL_DIGITS, MEMORY_COUNTER],
    )?;
    let next = match row {
        Some(row) => row.get_i64("next")?,
        None => 1,
    };
    Ok(format_id(next.max(1) as u64))
}

/// Highest sequential id number present, ignoring timestamp-based ids.
pub fn max_sequential_id(store: &Store) -> StoreResult<Option<u64>> {
    let row = store.get(
        "SELECT MAX(CAST(SUBSTR(id, 5) AS INTEGER)) AS max_id FROM memories \
         WHERE id GLOB 'mem-[0-9]*' AND LENGTH(id) <= ?",
        &sql_params![ID_PREFIX.len() + MAX_SEQUENTIAL_DIGITS],
    )?;
    Ok(match row {
        Some(row) => row
            .get_opt_str("max_id")?
            .and_then(|v| v.parse::<u64>().ok()),
        None => None,
    })
}

/// Make sure the allocator's next value is past `max_id`. Never moves it backwards.
pub fn repair_id_counter(store: &Store, max_id: u64) -> StoreResult<()> {
    store.run(
        "INSERT INTO id_counter (name, next_value) VALUES (?1, ?2) \
         ON CONFLICT(name) DO UPDATE SET next_value = MAX(next_value, excluded.next_value)",
        &sql_params![MEMORY_COUNTER, (max_id + 1) as i64],
    )?;
    Ok(())
}

/// Insert a new memory with its tags and supersedes link.
///
/// Without an explicit id, a fresh sequential id is allocated and insert-time
/// collisions are retried up to [`MAX_ID_ATTEMPTS`] times before a timestamp id
/// is used. An explicit id that already exists is treated as success and the
/// stored record is returned unchanged.
pub fn create_memory(store: &Store, new: &NewMemory) -> StoreResult<Memory> {
    let id = store.transaction(|| insert_memory(store, new))?;
    load_memory(store, &id)?.ok_or_else(|| StoreError::not_found(&id))
}

/// Row, tags, supersedes link and FTS entry of a new memory. Returns its id.
fn insert_memory(store: &Store, new: &NewMemory) -> StoreResult<String> {
    let created_at = new
        .created_at
        .clone()
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    let id = match &new.id {
        Some(id) => {
            match insert_row(store, id, new, &created_at) {
                Ok(()) => {}
                Err(e) if e.is_constraint() => {
                    tracing::debug!(id = %id, "memory already exists, treating insert as done");
                    return Ok(id.clone());
                }
                Err(e) => return Err(e),
            }
            if let Some(n) = parse_id_number(id) {
                repair_id_counter(store, n)?;
            }
            id.clone()
        }
        None => insert_with_fresh_id(store, new, &created_at)?,
    };

    replace_tags(store, &id, &new.tags)?;
    if let Some(old) = &new.supersedes {
        relations::add_link(store, &id, old, LinkType::Supersedes)?;
    }
    sync_fts(store, &id)?;
    tracing::info!(id = %id, category = %new.category, "memory created");
    Ok(id)
}

fn insert_with_fresh_id(store: &Store, new: &NewMemory, created_at: &str) -> StoreResult<String> {
    for attempt in 1..=MAX_ID_ATTEMPTS {
        let id = match allocate_id(store) {
            Ok(id) => id,
            Err(e) if e.is_busy() => break,
            Err(e) => return Err(e),
        };
        match insert_row(store, &id, new, created_at) {
            Ok(()) => {
                if !store.backend().supports_transactions() {
                    if let Some(n) = parse_id_number(&id) {
                        repair_id_counter(store, n)?;
                    }
                }
                return Ok(id);
            }
            Err(e) if e.is_constraint() => {
                tracing::debug!(id = %id, attempt, "id collision, reallocating");
                if let Some(n) = parse_id_number(&id) {
                    repair_id_counter(store, n)?;
                }
            }
            Err(e) if e.is_busy() => break,
            Err(e) => return Err(e),
        }
    }

    let id = format!("{ID_PREFIX}{}", Utc::now().timestamp_millis());
    tracing::warn!(id = %id, "sequential id allocation failed, using timestamp id");
    insert_row(store, &id, new, created_at)?;
    Ok(id)
}

fn insert_row(store: &Store, id: &str, new: &NewMemory, created_at: &str) -> StoreResult<()> {
    store.run(
        "INSERT INTO memories (id, title, summary, content, category, scope, importance, \
                               created_at, accessed_at, access_count, supersedes, archived) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        &sql_params![
            id,
            new.title.as_str(),
            new.summary.as_str(),
            new.content.as_str(),
            new.category.as_str(),
            scope_or_default(&new.scope),
            new.importance.as_str(),
            created_at,
            new.accessed_at.clone(),
            new.access_count,
            new.supersedes.clone(),
            new.archived,
        ],
    )?;
    Ok(())
}

fn scope_or_default(scope: &str) -> &str {
    if scope.trim().is_empty() {
        "project"
    } else {
        scope
    }
}

/// Replace the tag set of `id`. Does not touch the FTS row.
fn replace_tags(store: &Store, id: &str, tags: &[String]) -> StoreResult<()> {
    store.run("DELETE FROM memory_tags WHERE memory_id = ?", &sql_params![id])?;
    for tag in normalize_tags(tags) {
        store.run(
            "INSERT OR IGNORE INTO memory_tags (memory_id, tag) VALUES (?, ?)",
            &sql_params![id, tag],
        )?;
    }
    Ok(())
}

/// Fetch a memory with tags and links, bumping its access counter.
pub fn get_memory(store: &Store, id: &str) -> StoreResult<Option<Memory>> {
    let changed = store.run(
        "UPDATE memories SET access_count = access_count + 1, accessed_at = ? WHERE id = ?",
        &sql_params![Utc::now().to_rfc3339(), id],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    load_memory(store, id)
}

/// Fetch a memory with tags and links without touching access statistics.
pub fn load_memory(store: &Store, id: &str) -> StoreResult<Option<Memory>> {
    let Some(row) = store.get(&format!("{MEMORY_SELECT} WHERE m.id = ?"), &sql_params![id])? else {
        return Ok(None);
    };
    let mut memory = memory_from_row(&row)?;
    memory.links = relations::links_for(store, id)?;
    Ok(Some(memory))
}

/// Fetch several memories by id, in no particular order. Missing ids are skipped.
pub fn fetch_memories(store: &Store, ids: &[String]) -> StoreResult<Vec<Memory>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let params = Params::Positional(ids.iter().map(SqlValue::from).collect());
    store
        .all(&format!("{MEMORY_SELECT} WHERE m.id IN ({placeholders})"), &params)?
        .iter()
        .map(memory_from_row)
        .collect()
}

/// Apply the supplied fields of `update`. Supplied tags replace the whole set.
pub fn update_memory(store: &Store, id: &str, update: &MemoryUpdate) -> StoreResult<Memory> {
    store.transaction(|| apply_update(store, id, update))?;
    load_memory(store, id)?.ok_or_else(|| StoreError::not_found(id))
}

fn apply_update(store: &Store, id: &str, update: &MemoryUpdate) -> StoreResult<()> {
    if !exists(store, id)? {
        return Err(StoreError::not_found(id));
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut params: Vec<(String, SqlValue)> = vec![("id".into(), id.into())];
    let mut set = |column: &'static str, value: SqlValue| {
        sets.push(column);
        params.push((column.to_string(), value));
    };
    if let Some(v) = &update.title {
        set("title", v.into());
    }
    if let Some(v) = &update.summary {
        set("summary", v.into());
    }
    if let Some(v) = &update.content {
        set("content", v.into());
    }
    if let Some(v) = update.category {
        set("category", v.as_str().into());
    }
    if let Some(v) = &update.scope {
        set("scope", scope_or_default(v).into());
    }
    if let Some(v) = update.importance {
        set("importance", v.as_str().into());
    }
    if let Some(v) = &update.supersedes {
        set("supersedes", v.into());
    }

    if !sets.is_empty() {
        let assignments = sets
            .iter()
            .map(|c| format!("{c} = :{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        store.run(
            &format!("UPDATE memories SET {assignments} WHERE id = :id"),
            &Params::Named(params),
        )?;
    }

    if let Some(tags) = &update.tags {
        replace_tags(store, id, tags)?;
    }
    if let Some(old) = &update.supersedes {
        relations::add_link(store, id, old, LinkType::Supersedes)?;
    }
    sync_fts(store, id)?;
    tracing::debug!(id = %id, "memory updated");
    Ok(())
}

/// Delete a memory with its tags, links, embedding and FTS row.
///
/// Returns `false` when no such memory exists.
pub fn delete_memory(store: &Store, id: &str) -> StoreResult<bool> {
    store.transaction(|| delete_rows(store, id))
}

fn delete_rows(store: &Store, id: &str) -> StoreResult<bool> {
    store.run("DELETE FROM memories_fts WHERE id = ?", &sql_params![id])?;
    store.run("DELETE FROM memory_tags WHERE memory_id = ?", &sql_params![id])?;
    store.run("DELETE FROM memory_embeddings WHERE memory_id = ?", &sql_params![id])?;
    store.run(
        "DELETE FROM memory_links WHERE source_id = ?1 OR target_id = ?1",
        &sql_params![id],
    )?;
    let changed = store.run("DELETE FROM memories WHERE id = ?", &sql_params![id])?;
    if changed > 0 {
        tracing::info!(id = %id, "memory deleted");
    }
    Ok(changed > 0)
}

pub fn exists(store: &Store, id: &str) -> StoreResult<bool> {
    Ok(store
        .get("SELECT 1 AS found FROM memories WHERE id = ?", &sql_params![id])?
        .is_some())
}

/// Set the archived flag and export path together in one statement.
pub fn set_archived(store: &Store, id: &str, archived: bool, export_path: Option<&str>) -> StoreResult<()> {
    let changed = store.run(
        "UPDATE memories SET archived = ?, export_path = ? WHERE id = ?",
        &sql_params![archived, export_path, id],
    )?;
    if changed == 0 {
        return Err(StoreError::not_found(id));
    }
    Ok(())
}

pub fn set_export_path(store: &Store, id: &str, export_path: Option<&str>) -> StoreResult<()> {
    store.run(
        "UPDATE memories SET export_path = ? WHERE id = ?",
        &sql_params![export_path, id],
    )?;
    Ok(())
}

/// Overwrite access statistics. Used by import to reproduce a record exactly.
pub fn set_access(store: &Store, id: &str, accessed_at: Option<&str>, access_count: u32) -> StoreResult<()> {
    store.run(
        "UPDATE memories SET accessed_at = ?, access_count = ? WHERE id = ?",
        &sql_params![accessed_at, access_count, id],
    )?;
    Ok(())
}

/// Store or replace the embedding of a memory.
pub fn store_embedding(store: &Store, id: &str, embedding: &[f32]) -> StoreResult<()> {
    store.run(
        "INSERT INTO memory_embeddings (memory_id, vector, dimensions, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(memory_id) DO UPDATE SET vector = excluded.vector, \
             dimensions = excluded.dimensions, created_at = excluded.created_at",
        &sql_params![
            id,
            embedding_to_bytes(embedding),
            embedding.len(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn decode_vector(row: &Row) -> StoreResult<Vec<f32>> {
    let hex_str = row.get_str("vector_hex")?;
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| StoreError::backend(format!("corrupt embedding: {e}")))?;
    Ok(bytes_to_embedding(&bytes))
}

pub fn get_embedding(store: &Store, id: &str) -> StoreResult<Option<Vec<f32>>> {
    match store.get(
        "SELECT hex(vector) AS vector_hex FROM memory_embeddings WHERE memory_id = ?",
        &sql_params![id],
    )? {
        Some(row) => Ok(Some(decode_vector(&row)?)),
        None => Ok(None),
    }
}

/// Every stored embedding, optionally including archived memories.
pub fn get_all_embeddings(store: &Store, include_archived: bool) -> StoreResult<Vec<(String, Vec<f32>)>> {
    let rows = store.all(
        "SELECT e.memory_id, hex(e.vector) AS vector_hex FROM memory_embeddings e \
         JOIN memories m ON m.id = e.memory_id \
         WHERE ? OR m.archived = 0",
        &sql_params![include_archived],
    )?;
    rows.iter()
        .map(|row| Ok((row.get_str("memory_id")?, decode_vector(row)?)))
        .collect()
}

/// List memories newest first.
pub fn list_memories(store: &Store, filter: &ListFilter) -> StoreResult<Vec<Memory>> {
    let mut sql = format!("{MEMORY_SELECT} WHERE 1 = 1");
    let mut params: Vec<SqlValue> = Vec::new();

    if !filter.include_archived {
        sql.push_str(" AND m.archived = 0");
    }
    if let Some(category) = filter.category {
        sql.push_str(" AND m.category = ?");
        params.push(category.as_str().into());
    }
    if let Some(importance) = filter.importance {
        sql.push_str(" AND m.importance = ?");
        params.push(importance.as_str().into());
    }
    if let Some(tag) = &filter.tag {
        sql.push_str(" AND EXISTS (SELECT 1 FROM memory_tags t WHERE t.memory_id = m.id AND t.tag = ?)");
        params.push(tag.trim().to_lowercase().into());
    }
    sql.push_str(" ORDER BY m.created_at DESC, m.id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        params.push(limit.into());
    }

    let params = if params.is_empty() {
        Params::None
    } else {
        Params::Positional(params)
    };
    store.all(&sql, &params)?.iter().map(memory_from_row).collect()
}

/// Low-importance, rarely accessed, unlinked, unarchived memories.
pub fn get_archive_candidates(store: &Store) -> StoreResult<Vec<Memory>> {
    store
        .all(
            &format!(
                "{MEMORY_SELECT} WHERE m.importance = 'low' AND m.access_count <= 1 AND m.archived = 0 \
                 AND NOT EXISTS (SELECT 1 FROM memory_links l WHERE l.source_id = m.id) \
                 ORDER BY m.created_at"
            ),
            &Params::None,
        )?
        .iter()
        .map(memory_from_row)
        .collect()
}
