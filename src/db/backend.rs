//! The statement-level interface shared by both storage backends.
//!
//! A [`Backend`] runs SQL with positional or named parameters and returns rows
//! as owned [`Row`]s, so callers never see which engine sits underneath.

use serde::Serialize;

use crate::error::{StoreError, StoreResult};

/// Which implementation is serving the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process SQLite through rusqlite.
    Native,
    /// `sqlite3` command-line shell, one subprocess per call.
    Shell,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Shell => "shell",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single SQL value, owned.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        Self::Text(v.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<usize> for SqlValue {
    fn from(v: usize) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Statement parameters.
#[derive(Debug, Clone, Default)]
pub enum Params {
    #[default]
    None,
    /// Bound to `?`/`?N` placeholders in order.
    Positional(Vec<SqlValue>),
    /// Bound to `:name` placeholders. Names are given without the prefix.
    Named(Vec<(String, SqlValue)>),
}

/// Build [`Params::Positional`] from a list of expressions.
#[macro_export]
macro_rules! sql_params {
    () => {
        $crate::db::backend::Params::None
    };
    ($($value:expr),+ $(,)?) => {
        $crate::db::backend::Params::Positional(vec![$($crate::db::backend::SqlValue::from($value)),+])
    };
}

/// Build [`Params::Named`] from `name => value` pairs.
#[macro_export]
macro_rules! sql_named {
    ($($name:literal => $value:expr),+ $(,)?) => {
        $crate::db::backend::Params::Named(vec![
            $(($name.to_string(), $crate::db::backend::SqlValue::from($value))),+
        ])
    };
}

/// One result row, columns in select order.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    pub fn value(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, v)| v)
    }

    fn require(&self, name: &str) -> StoreResult<&SqlValue> {
        self.value(name)
            .ok_or_else(|| StoreError::backend(format!("missing column: {name}")))
    }

    pub fn get_str(&self, name: &str) -> StoreResult<String> {
        self.get_opt_str(name)?
            .ok_or_else(|| StoreError::backend(format!("column {name} is NULL")))
    }

    pub fn get_opt_str(&self, name: &str) -> StoreResult<Option<String>> {
        Ok(match self.require(name)? {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Real(f) => Some(f.to_string()),
            SqlValue::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
        })
    }

    pub fn get_i64(&self, name: &str) -> StoreResult<i64> {
        match self.require(name)? {
            SqlValue::Integer(i) => Ok(*i),
            SqlValue::Real(f) => Ok(*f as i64),
            SqlValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| StoreError::backend(format!("column {name} is not an integer: {s}"))),
            SqlValue::Null => Ok(0),
            SqlValue::Blob(_) => Err(StoreError::backend(format!("column {name} is a blob"))),
        }
    }

    pub fn get_f64(&self, name: &str) -> StoreResult<f64> {
        match self.require(name)? {
            SqlValue::Real(f) => Ok(*f),
            SqlValue::Integer(i) => Ok(*i as f64),
            SqlValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| StoreError::backend(format!("column {name} is not a number: {s}"))),
            SqlValue::Null => Ok(0.0),
            SqlValue::Blob(_) => Err(StoreError::backend(format!("column {name} is a blob"))),
        }
    }

    pub fn get_bool(&self, name: &str) -> StoreResult<bool> {
        Ok(self.get_i64(name)? != 0)
    }
}

/// The interface both storage backends implement.
///
/// `run` executes for side effects and returns the number of changed rows,
/// `all` returns every row, `exec` runs a multi-statement script without
/// parameters.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn run(&self, sql: &str, params: &Params) -> StoreResult<usize>;

    fn all(&self, sql: &str, params: &Params) -> StoreResult<Vec<Row>>;

    fn exec(&self, script: &str) -> StoreResult<()>;

    /// Whether a single `exec` can hold a multi-statement transaction whose
    /// results are read back in the same call.
    fn supports_transactions(&self) -> bool;

    fn close(&self) -> StoreResult<()>;
}

impl dyn Backend {
    pub fn prepare<'a>(&'a self, sql: &'a str) -> Statement<'a> {
        Statement { backend: self, sql }
    }
}

/// A prepared statement bound to a backend.
pub struct Statement<'a> {
    backend: &'a dyn Backend,
    sql: &'a str,
}

impl<'a> Statement<'a> {
    pub fn run(&self, params: &Params) -> StoreResult<usize> {
        self.backend.run(self.sql, params)
    }

    pub fn all(&self, params: &Params) -> StoreResult<Vec<Row>> {
        self.backend.all(self.sql, params)
    }

    /// First row, if any.
    pub fn get(&self, params: &Params) -> StoreResult<Option<Row>> {
        Ok(self.backend.all(self.sql, params)?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_getters_coerce_text() {
        let row = Row::new(vec![
            ("n".into(), SqlValue::Text("42".into())),
            ("f".into(), SqlValue::Integer(3)),
            ("s".into(), SqlValue::Null),
        ]);
        assert_eq!(row.get_i64("n").unwrap(), 42);
        assert!((row.get_f64("f").unwrap() - 3.0).abs() < f64::EPSILON);
        assert_eq!(row.get_opt_str("s").unwrap(), None);
        assert!(row.get_str("missing").is_err());
    }

    #[test]
    fn params_macros_build_values() {
        let p = sql_params!["a", 1i64, None::<String>];
        match p {
            Params::Positional(v) => {
                assert_eq!(v[0], SqlValue::Text("a".into()));
                assert_eq!(v[1], SqlValue::Integer(1));
                assert_eq!(v[2], SqlValue::Null);
            }
            _ => panic!("expected positional"),
        }
        let n = sql_named!["id" => "mem-001"];
        assert!(matches!(n, Params::Named(ref v) if v[0].0 == "id"));
    }
}
