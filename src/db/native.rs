//! In-process backend over rusqlite (bundled SQLite with FTS5).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;

use super::backend::{Backend, BackendKind, Params, Row, SqlValue};
use crate::error::{StoreError, StoreResult};

pub struct NativeBackend {
    conn: Mutex<Option<Connection>>,
}

impl NativeBackend {
    /// Open (or create) the store file, enabling WAL and foreign keys.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Short per-statement wait; longer contention is handled by RetryPolicy.
        conn.busy_timeout(Duration::from_millis(100))?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::backend(format!("connection lock poisoned: {e}")))
    }
}

fn to_value(v: &SqlValue) -> Value {
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_value_ref(v: ValueRef<'_>) -> SqlValue {
    match v {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &Params) -> StoreResult<()> {
    match params {
        Params::None => {}
        Params::Positional(values) => {
            for (i, v) in values.iter().enumerate() {
                stmt.raw_bind_parameter(i + 1, to_value(v))?;
            }
        }
        Params::Named(values) => {
            for (name, v) in values {
                if let Some(idx) = stmt.parameter_index(&format!(":{name}"))? {
                    stmt.raw_bind_parameter(idx, to_value(v))?;
                }
            }
        }
    }
    Ok(())
}

fn closed() -> StoreError {
    StoreError::Unavailable("store has been closed".into())
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn run(&self, sql: &str, params: &Params) -> StoreResult<usize> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(closed)?;
        let mut stmt = conn.prepare(sql)?;
        bind_params(&mut stmt, params)?;
        Ok(stmt.raw_execute()?)
    }

    fn all(&self, sql: &str, params: &Params) -> StoreResult<Vec<Row>> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(closed)?;
        let mut stmt = conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        bind_params(&mut stmt, params)?;

        let mut rows = stmt.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut columns = Vec::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                columns.push((name.clone(), from_value_ref(row.get_ref(i)?)));
            }
            out.push(Row::new(columns));
        }
        Ok(out)
    }

    fn exec(&self, script: &str) -> StoreResult<()> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or_else(closed)?;
        conn.execute_batch(script)?;
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn close(&self) -> StoreResult<()> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sql_named, sql_params};

    #[test]
    fn run_and_all_roundtrip() {
        let db = NativeBackend::open_in_memory().unwrap();
        db.exec("CREATE TABLE t (id TEXT PRIMARY KEY, n INTEGER, b BLOB)").unwrap();
        let changed = db
            .run("INSERT INTO t VALUES (?, ?, ?)", &sql_params!["a", 1i64, vec![1u8, 2]])
            .unwrap();
        assert_eq!(changed, 1);
        db.run(
            "INSERT INTO t VALUES (:id, :n, NULL)",
            &sql_named!["id" => "b", "n" => 2i64],
        )
        .unwrap();

        let rows = db.all("SELECT id, n, b FROM t ORDER BY id", &Params::None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_str("id").unwrap(), "a");
        assert_eq!(rows[0].value("b"), Some(&SqlValue::Blob(vec![1, 2])));
        assert_eq!(rows[1].get_i64("n").unwrap(), 2);
    }

    #[test]
    fn closed_backend_is_unavailable() {
        let db = NativeBackend::open_in_memory().unwrap();
        db.close().unwrap();
        assert!(matches!(db.exec("SELECT 1"), Err(StoreError::Unavailable(_))));
    }
}
