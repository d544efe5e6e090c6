//! Forward-only schema migration framework.
//!
//! Tracks the schema version in `schema_meta` and runs sequential migrations
//! to bring the store up to [`CURRENT_SCHEMA_VERSION`].

use crate::db::backend::{Backend, Params};
use crate::error::StoreResult;
use crate::sql_params;

/// The schema version that the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Name of the allocator row in `id_counter`.
pub const MEMORY_COUNTER: &str = "memories";

/// Get the current schema version from the store.
pub fn get_schema_version(backend: &dyn Backend) -> StoreResult<u32> {
    let rows = backend.all(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        &Params::None,
    )?;
    Ok(rows
        .first()
        .and_then(|r| r.get_str("value").ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

fn update_schema_version(backend: &dyn Backend, version: u32) -> StoreResult<()> {
    backend.run(
        "UPDATE schema_meta SET value = ? WHERE key = 'schema_version'",
        &sql_params![version.to_string()],
    )?;
    Ok(())
}

/// Get the stored embedding model identifier, if any.
pub fn get_embedding_model(backend: &dyn Backend) -> StoreResult<Option<String>> {
    let rows = backend.all(
        "SELECT value FROM schema_meta WHERE key = 'embedding_model'",
        &Params::None,
    )?;
    match rows.first() {
        Some(row) => Ok(Some(row.get_str("value")?)),
        None => Ok(None),
    }
}

/// Set the stored embedding model identifier.
pub fn set_embedding_model(backend: &dyn Backend, model: &str) -> StoreResult<()> {
    backend.run(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('embedding_model', ?)",
        &sql_params![model],
    )?;
    Ok(())
}

/// Run any pending forward-only migrations.
pub fn run_migrations(backend: &dyn Backend) -> StoreResult<()> {
    let mut version = get_schema_version(backend)?;
    tracing::debug!(schema_version = version, target = CURRENT_SCHEMA_VERSION, "checking migrations");

    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        tracing::info!(from = version, to = next, "running migration");

        match next {
            2 => migrate_v1_to_v2(backend)?,
            _ => {
                tracing::error!(version = next, "unknown migration target");
                break;
            }
        }

        update_schema_version(backend, next)?;
        version = next;
    }

    Ok(())
}

/// Migration v1 → v2: seed the id counter past any ids already in the store.
///
/// Ids with more than nine digits are timestamp-based fallbacks and are not
/// part of the sequence.
fn migrate_v1_to_v2(backend: &dyn Backend) -> StoreResult<()> {
    backend.run(
        "INSERT OR IGNORE INTO id_counter (name, next_value) \
         SELECT ?, COALESCE(MAX(CAST(SUBSTR(id, 5) AS INTEGER)), 0) + 1 FROM memories \
         WHERE id GLOB 'mem-[0-9]*' AND LENGTH(id) <= 13",
        &sql_params![MEMORY_COUNTER],
    )?;
    Ok(())
}
