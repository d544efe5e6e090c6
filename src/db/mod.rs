//! Store lifecycle: backend selection, schema initialization, close.
//!
//! [`Store::open`] decides once which [`Backend`] serves the process
//! (native rusqlite first, then the `sqlite3` shell) and hands back a cheap,
//! cloneable handle that callers pass around explicitly.

pub mod backend;
pub mod escape;
pub mod migrations;
pub mod native;
pub mod retry;
pub mod schema;
pub mod shell;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::MemkeepConfig;
use crate::error::{StoreError, StoreResult};
use backend::{Backend, BackendKind, Params, Row};
use native::NativeBackend;
use retry::RetryPolicy;
use shell::ShellBackend;

/// Which backend the configuration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPreference {
    Auto,
    Native,
    Shell,
}

impl std::str::FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "shell" => Ok(Self::Shell),
            _ => Err(format!("unknown backend: {s} (expected auto, native or shell)")),
        }
    }
}

/// Health summary returned by the `backend` command.
#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub backend: BackendKind,
    /// True when running on the shell fallback or without embeddings.
    pub degraded: bool,
    pub path: String,
    pub schema_version: u32,
    pub memory_count: u64,
    pub embeddings_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

/// Handle to an open store. Clones share the same backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
    path: PathBuf,
    /// Serializes transactions across clones sharing one connection.
    tx_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Open the store described by `config`, creating file and schema if absent.
    pub fn open(config: &MemkeepConfig) -> StoreResult<Self> {
        let path = config.resolved_db_path();
        let preference: BackendPreference = config
            .storage
            .backend
            .parse()
            .map_err(StoreError::Unavailable)?;
        let retry = RetryPolicy::from_config(&config.retry);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let backend = select_backend(&path, preference, &config.storage.sqlite3_binary)?;
        tracing::info!(path = %path.display(), backend = %backend.kind(), "store opened");
        Self::with_backend(backend, path, retry)
    }

    /// In-memory native store. Used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend: Arc<dyn Backend> = Arc::new(NativeBackend::open_in_memory()?);
        Self::with_backend(backend, PathBuf::from(":memory:"), RetryPolicy::immediate(3))
    }

    /// Wrap an already-selected backend and initialize the schema on it.
    ///
    /// Initialization is retried under `retry` so concurrent initializers
    /// racing on a fresh file do not fail on "database is locked".
    pub fn with_backend(backend: Arc<dyn Backend>, path: PathBuf, retry: RetryPolicy) -> StoreResult<Self> {
        retry.run("initialize", || {
            schema::init_schema(backend.as_ref())?;
            migrations::run_migrations(backend.as_ref())
        })?;
        Ok(Self {
            backend,
            retry,
            path,
            tx_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a statement for its side effects under the retry policy.
    pub fn run(&self, sql: &str, params: &Params) -> StoreResult<usize> {
        self.retry.run(statement_label(sql), || self.backend.run(sql, params))
    }

    /// Run a query under the retry policy and return every row.
    pub fn all(&self, sql: &str, params: &Params) -> StoreResult<Vec<Row>> {
        self.retry.run(statement_label(sql), || self.backend.all(sql, params))
    }

    /// First row of a query, if any.
    pub fn get(&self, sql: &str, params: &Params) -> StoreResult<Option<Row>> {
        Ok(self.all(sql, params)?.into_iter().next())
    }

    /// Run `op` between `BEGIN IMMEDIATE` and `COMMIT`, rolling back on error.
    ///
    /// Backends without per-call transactions run `op` as plain autocommit
    /// statements. Not reentrant: `op` must not open another transaction.
    pub fn transaction<T>(&self, op: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
        if !self.backend.supports_transactions() {
            return op();
        }
        let _guard = self
            .tx_lock
            .lock()
            .map_err(|e| StoreError::backend(format!("transaction lock poisoned: {e}")))?;

        self.retry.run("BEGIN", || self.backend.exec("BEGIN IMMEDIATE"))?;
        let result = op().and_then(|value| {
            self.retry.run("COMMIT", || self.backend.exec("COMMIT"))?;
            Ok(value)
        });
        if let Err(e) = &result {
            tracing::debug!(error = %e, "rolling back transaction");
            if let Err(rollback) = self.backend.exec("ROLLBACK") {
                tracing::warn!(error = %rollback, "rollback failed");
            }
        }
        result
    }

    /// Release the underlying connection. Further calls report `Unavailable`.
    pub fn close(&self) -> StoreResult<()> {
        tracing::debug!(path = %self.path.display(), "closing store");
        self.backend.close()
    }

    /// Backend health report. Embedding availability is supplied by the caller.
    pub fn report(&self, embeddings_available: bool) -> StoreResult<BackendReport> {
        let backend = self.backend();
        let memory_count = self
            .get("SELECT COUNT(*) AS n FROM memories", &Params::None)?
            .map(|r| r.get_i64("n"))
            .transpose()?
            .unwrap_or(0);
        Ok(BackendReport {
            backend: self.kind(),
            degraded: self.kind() == BackendKind::Shell || !embeddings_available,
            path: self.path.display().to_string(),
            schema_version: migrations::get_schema_version(backend)?,
            memory_count: memory_count.max(0) as u64,
            embeddings_available,
            embedding_model: migrations::get_embedding_model(backend)?,
        })
    }
}

/// Leading keyword of a statement, used to label retry logs.
fn statement_label(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("statement")
}

/// Pick the backend for this process.
///
/// `Auto` tries the native binding first and falls back to the shell; if
/// neither can be used the result is [`StoreError::Unavailable`].
pub fn select_backend(
    path: &Path,
    preference: BackendPreference,
    sqlite3_binary: &str,
) -> StoreResult<Arc<dyn Backend>> {
    let open_native = || -> StoreResult<Arc<dyn Backend>> { Ok(Arc::new(NativeBackend::open(path)?)) };
    let open_shell = || -> StoreResult<Arc<dyn Backend>> {
        let binary = ShellBackend::locate(sqlite3_binary).ok_or_else(|| {
            StoreError::Unavailable(format!("`{sqlite3_binary}` was not found on PATH"))
        })?;
        Ok(Arc::new(ShellBackend::new(binary, path)))
    };

    match preference {
        BackendPreference::Native => open_native(),
        BackendPreference::Shell => open_shell(),
        BackendPreference::Auto => match open_native() {
            Ok(backend) => Ok(backend),
            Err(native_err) => {
                tracing::warn!(error = %native_err, "native backend unavailable, trying sqlite3 shell");
                open_shell().map_err(|shell_err| {
                    StoreError::Unavailable(format!(
                        "native: {native_err}; shell: {shell_err}. Install sqlite3 or check the store path"
                    ))
                })
            }
        },
    }
}
