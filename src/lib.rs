//! Local hybrid knowledge store.
//!
//! memkeep keeps short, titled memories in SQLite, finds them again through a
//! blend of FTS5 keyword ranking and local embedding similarity, and mirrors
//! every record to a markdown file so the collection can live in git.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration and environment overrides
//! - [`db`]: storage backends (rusqlite or the `sqlite3` binary), schema, retry
//! - [`embedding`]: text-to-vector pipeline via ONNX Runtime
//! - [`memory`]: records, search, statistics and the markdown mirror
//! - [`service`]: one method per command, used by [`cli`]

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod service;
