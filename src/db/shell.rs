//! Fallback backend that drives the `sqlite3` command-line shell.
//!
//! Each call spawns `sqlite3 -json -bail <db>` and pipes the statement in on
//! stdin. Parameters are rendered as literals by [`super::escape`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::backend::{Backend, BackendKind, Params, Row, SqlValue};
use super::escape;
use crate::error::{StoreError, StoreResult};

/// Busy wait handed to the shell's `.timeout` for each invocation (ms).
const SHELL_BUSY_TIMEOUT_MS: u32 = 100;

pub struct ShellBackend {
    binary: PathBuf,
    db_path: PathBuf,
}

impl ShellBackend {
    /// Locate `binary` on PATH. Returns `None` when no shell is installed.
    pub fn locate(binary: &str) -> Option<PathBuf> {
        which::which(binary).ok()
    }

    pub fn new(binary: PathBuf, db_path: &Path) -> Self {
        Self {
            binary,
            db_path: db_path.to_path_buf(),
        }
    }

    /// Run a script through the shell and return its stdout.
    fn invoke(&self, script: &str) -> StoreResult<String> {
        let mut child = Command::new(&self.binary)
            .arg("-json")
            .arg("-bail")
            .arg(&self.db_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| StoreError::backend("sqlite3 stdin unavailable"))?;
            writeln!(stdin, ".timeout {SHELL_BUSY_TIMEOUT_MS}")?;
            writeln!(stdin, "PRAGMA foreign_keys = ON;")?;
            stdin.write_all(script.as_bytes())?;
            if !script.trim_end().ends_with(';') {
                stdin.write_all(b";")?;
            }
            stdin.write_all(b"\n")?;
        }

        let output = child.wait_with_output()?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(StoreError::backend(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse `-json` output. Each result-producing statement prints one array.
pub(crate) fn parse_json_rows(stdout: &str) -> StoreResult<Vec<Row>> {
    let mut rows = Vec::new();
    let stream = serde_json::Deserializer::from_str(stdout).into_iter::<serde_json::Value>();
    for batch in stream {
        let serde_json::Value::Array(items) = batch? else {
            return Err(StoreError::backend("unexpected sqlite3 output"));
        };
        for item in items {
            let serde_json::Value::Object(map) = item else {
                return Err(StoreError::backend("unexpected sqlite3 row"));
            };
            let columns = map
                .into_iter()
                .map(|(k, v)| (k, json_to_sql(v)))
                .collect();
            rows.push(Row::new(columns));
        }
    }
    Ok(rows)
}

fn json_to_sql(v: serde_json::Value) -> SqlValue {
    match v {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => SqlValue::Text(s),
        other => SqlValue::Text(other.to_string()),
    }
}

impl Backend for ShellBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shell
    }

    fn run(&self, sql: &str, params: &Params) -> StoreResult<usize> {
        let bound = escape::bind(sql, params)?;
        let stdout = self.invoke(&format!(
            "{};\nSELECT changes() AS changes;",
            bound.trim_end().trim_end_matches(';')
        ))?;
        let rows = parse_json_rows(&stdout)?;
        match rows.last() {
            Some(row) => Ok(row.get_i64("changes")?.max(0) as usize),
            None => Ok(0),
        }
    }

    fn all(&self, sql: &str, params: &Params) -> StoreResult<Vec<Row>> {
        let bound = escape::bind(sql, params)?;
        parse_json_rows(&self.invoke(&bound)?)
    }

    fn exec(&self, script: &str) -> StoreResult<()> {
        self.invoke(script).map(|_| ())
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
