use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MemkeepConfig {
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Project root; the private store and the markdown mirror live beneath it.
    pub project_root: String,
    /// Private runtime directory, relative to `project_root`.
    pub state_dir: String,
    /// Shareable markdown mirror directory, relative to `project_root`.
    pub memory_dir: String,
    pub db_file: String,
    /// `auto`, `native` or `shell`.
    pub backend: String,
    pub sqlite3_binary: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Overall ceiling across all attempts.
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local` or `none`.
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub keyword_weight: f64,
    pub semantic_weight: f64,
    pub relevance_weight: f64,
    pub high_importance_boost: f64,
    pub low_importance_penalty: f64,
    pub access_boost_cap: f64,
    pub archived_penalty: f64,
    pub min_similarity: f32,
    pub semantic_top_k: usize,
    pub default_limit: usize,
    pub keyword_fallback_floor: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            project_root: ".".into(),
            state_dir: ".state/memory".into(),
            memory_dir: "memory".into(),
            db_file: "memory.db".into(),
            backend: "auto".into(),
            sqlite3_binary: "sqlite3".into(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 50,
            max_delay_ms: 500,
            timeout_ms: 5000,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_home_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            max_tokens: 256,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.4,
            semantic_weight: 0.4,
            relevance_weight: 0.2,
            high_importance_boost: 0.3,
            low_importance_penalty: 0.2,
            access_boost_cap: 0.2,
            archived_penalty: 0.3,
            min_similarity: 0.3,
            semantic_top_k: 20,
            default_limit: 10,
            keyword_fallback_floor: 0.2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
        }
    }
}

/// Returns `~/.memkeep/`, or `./.memkeep` when no home directory is known.
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memkeep")
}

impl MemkeepConfig {
    /// Load `<root>/.state/memory/config.toml` (if present) then apply env overrides.
    ///
    /// `MEMKEEP_ROOT` is consulted first so the config file is looked up under
    /// the overridden root.
    pub fn load(project_root: Option<&Path>) -> Result<Self> {
        let root = project_root
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("MEMKEEP_ROOT").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        let defaults = StorageConfig::default();
        let path = root.join(&defaults.state_dir).join("config.toml");

        let mut config = Self::load_from(&path)?;
        config.storage.project_root = root.to_string_lossy().into_owned();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a specific path without env overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")
        } else {
            info!("no config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Config rooted at `root` with defaults everywhere else. Used by tests and `init`.
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.storage.project_root = root.as_ref().to_string_lossy().into_owned();
        config
    }

    /// Apply environment variable overrides
    /// (MEMKEEP_BACKEND, MEMKEEP_LOG_LEVEL, MEMKEEP_EMBEDDINGS).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMKEEP_BACKEND") {
            self.storage.backend = val;
        }
        if let Ok(val) = std::env::var("MEMKEEP_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("MEMKEEP_EMBEDDINGS") {
            if val == "0" || val.eq_ignore_ascii_case("false") {
                self.embedding.provider = "none".into();
            }
        }
    }

    pub fn project_root(&self) -> PathBuf {
        expand_tilde(&self.storage.project_root)
    }

    /// `<project>/.state/memory/<db_file>`
    pub fn resolved_db_path(&self) -> PathBuf {
        self.project_root()
            .join(&self.storage.state_dir)
            .join(&self.storage.db_file)
    }

    /// `<project>/memory`, root of the exports/ and archive/ mirror.
    pub fn memory_root(&self) -> PathBuf {
        self.project_root().join(&self.storage.memory_dir)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
