//! Directed links between memories and external identifiers.
//!
//! A link's source must be an existing memory; its target may be another
//! memory id or any external key (an issue number, a ticket). At most one link
//! exists per (source, target) pair: linking again replaces the type.

use chrono::Utc;

use crate::db::backend::{Params, SqlValue};
use crate::db::Store;
use crate::error::{StoreError, StoreResult};
use crate::memory::store::exists;
use crate::memory::types::{Link, LinkType};
use crate::sql_params;

/// Create or replace the link `source → target`.
pub fn add_link(store: &Store, source_id: &str, target_id: &str, link_type: LinkType) -> StoreResult<Link> {
    if !exists(store, source_id)? {
        return Err(StoreError::not_found(source_id));
    }
    let target_id = target_id.trim();
    if target_id.is_empty() {
        return Err(StoreError::backend("link target must not be empty"));
    }

    let now = Utc::now().to_rfc3339();
    store.run(
        "INSERT INTO memory_links (source_id, target_id, link_type, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(source_id, target_id) DO UPDATE SET link_type = excluded.link_type",
        &sql_params![source_id, target_id, link_type.as_str(), now.as_str()],
    )?;
    tracing::debug!(source = %source_id, target = %target_id, link_type = %link_type, "link stored");

    Ok(Link {
        source_id: source_id.to_string(),
        target_id: target_id.to_string(),
        link_type,
        created_at: now,
    })
}

/// Make `links` the complete outgoing link set of `source_id`.
///
/// Targets no longer listed are dropped; kept targets retain their creation time.
pub fn replace_links(store: &Store, source_id: &str, links: &[(String, LinkType)]) -> StoreResult<Vec<Link>> {
    if !exists(store, source_id)? {
        return Err(StoreError::not_found(source_id));
    }
    store.transaction(|| {
        let mut params = vec![SqlValue::from(source_id)];
        let mut sql = String::from("DELETE FROM memory_links WHERE source_id = ?");
        if !links.is_empty() {
            let placeholders = vec!["?"; links.len()].join(", ");
            sql.push_str(&format!(" AND target_id NOT IN ({placeholders})"));
            params.extend(links.iter().map(|(target, _)| SqlValue::from(target.trim())));
        }
        let dropped = store.run(&sql, &Params::Positional(params))?;
        if dropped > 0 {
            tracing::debug!(source = %source_id, dropped, "stale links removed");
        }
        links
            .iter()
            .map(|(target, link_type)| add_link(store, source_id, target, *link_type))
            .collect()
    })
}

/// Outgoing links of `id`, oldest first.
pub fn links_for(store: &Store, id: &str) -> StoreResult<Vec<Link>> {
    store
        .all(
            "SELECT source_id, target_id, link_type, created_at FROM memory_links \
             WHERE source_id = ? ORDER BY created_at, target_id",
            &sql_params![id],
        )?
        .iter()
        .map(|row| {
            Ok(Link {
                source_id: row.get_str("source_id")?,
                target_id: row.get_str("target_id")?,
                link_type: row
                    .get_str("link_type")?
                    .parse()
                    .unwrap_or(LinkType::Related),
                created_at: row.get_str("created_at")?,
            })
        })
        .collect()
}
