use std::collections::BTreeMap;

use serde::Serialize;

use crate::db::backend::Params;
use crate::db::Store;
use crate::error::StoreResult;

/// Response from `stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: u64,
    pub active: u64,
    pub archived: u64,
    pub by_category: BTreeMap<String, u64>,
    pub by_importance: BTreeMap<String, u64>,
    pub tag_count: u64,
    pub link_count: u64,
    pub embedding_count: u64,
    pub most_accessed: Vec<AccessEntry>,
    pub db_size_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct AccessEntry {
    pub id: String,
    pub title: String,
    pub access_count: u32,
}

/// Compute store statistics. Archived memories count toward every total except `active`.
pub fn get_stats(store: &Store) -> StoreResult<StatsResponse> {
    let (total, archived) = match store.get(
        "SELECT COUNT(*) AS total, COALESCE(SUM(archived), 0) AS archived FROM memories",
        &Params::None,
    )? {
        Some(row) => (count(row.get_i64("total")?), count(row.get_i64("archived")?)),
        None => (0, 0),
    };

    let db_size_bytes = std::fs::metadata(store.path())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total,
        active: total.saturating_sub(archived),
        archived,
        by_category: grouped(store, "category")?,
        by_importance: grouped(store, "importance")?,
        tag_count: scalar(store, "SELECT COUNT(DISTINCT tag) AS n FROM memory_tags")?,
        link_count: scalar(store, "SELECT COUNT(*) AS n FROM memory_links")?,
        embedding_count: scalar(store, "SELECT COUNT(*) AS n FROM memory_embeddings")?,
        most_accessed: most_accessed(store)?,
        db_size_bytes,
    })
}

fn count(n: i64) -> u64 {
    n.max(0) as u64
}

fn scalar(store: &Store, sql: &str) -> StoreResult<u64> {
    match store.get(sql, &Params::None)? {
        Some(row) => Ok(count(row.get_i64("n")?)),
        None => Ok(0),
    }
}

/// `column` is one of a fixed set of names, never user input.
fn grouped(store: &Store, column: &str) -> StoreResult<BTreeMap<String, u64>> {
    let rows = store.all(
        &format!("SELECT {column} AS k, COUNT(*) AS n FROM memories GROUP BY {column}"),
        &Params::None,
    )?;
    let mut out = BTreeMap::new();
    for row in rows {
        out.insert(row.get_str("k")?, count(row.get_i64("n")?));
    }
    Ok(out)
}

fn most_accessed(store: &Store) -> StoreResult<Vec<AccessEntry>> {
    store
        .all(
            "SELECT id, title, access_count FROM memories WHERE access_count > 0 \
             ORDER BY access_count DESC, id LIMIT 5",
            &Params::None,
        )?
        .iter()
        .map(|row| {
            Ok(AccessEntry {
                id: row.get_str("id")?,
                title: row.get_str("title")?,
                access_count: row.get_i64("access_count")?.max(0) as u32,
            })
        })
        .collect()
}
