//! Command-line surface. Every command prints exactly one JSON object on
//! stdout: the payload merged with `"success": true`, or
//! `{"success": false, "error": "..."}`.

pub mod model;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::MemkeepConfig;
use crate::memory::types::{Category, Importance, LinkType, ListFilter, MemoryUpdate};
use crate::service::{MemoryService, WriteRequest};

/// Longest error message printed to stdout.
pub const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Parser)]
#[command(name = "memkeep", version, about = "Local hybrid knowledge store for short memories")]
pub struct Cli {
    /// Project root (defaults to $MEMKEEP_ROOT, then the current directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the store and the markdown mirror layout
    Init,
    /// Record a new memory
    Write(WriteArgs),
    /// Hybrid keyword + semantic search
    Search(SearchArgs),
    /// Keyword-only search
    Quick(SearchArgs),
    /// Show one memory and count the access
    Get { id: String },
    /// List memories, newest first
    List(ListArgs),
    /// Aggregate counts
    Stats,
    /// Report the active storage backend and degradation
    Backend,
    /// Change fields of an existing memory
    Update(UpdateArgs),
    /// Link two memories
    Link {
        source: String,
        target: String,
        #[arg(long = "type", default_value = "related")]
        link_type: LinkType,
    },
    /// Move a memory to the archive
    Archive { id: String },
    /// Remove a memory and its export file
    Delete { id: String },
    /// Memories that look safe to archive
    Candidates,
    /// Rewrite every export file
    Export,
    /// Re-import the store from the export files
    Rebuild,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ModelAction {
    /// Download the embedding model to the cache directory
    Download,
}

#[derive(Debug, Args)]
pub struct WriteArgs {
    #[arg(long)]
    pub title: String,
    #[arg(long)]
    pub summary: String,
    #[arg(long)]
    pub content: Option<String>,
    #[arg(long)]
    pub category: Option<Category>,
    #[arg(long)]
    pub scope: Option<String>,
    #[arg(long)]
    pub importance: Option<Importance>,
    /// Comma-separated
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,
    #[arg(long)]
    pub supersedes: Option<String>,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Query text; supports "phrases", tag:x, category:x, importance:x, --include-archive
    #[arg(required = true, allow_hyphen_values = true, trailing_var_arg = true)]
    pub query: Vec<String>,
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    pub category: Option<Category>,
    #[arg(long)]
    pub importance: Option<Importance>,
    #[arg(long)]
    pub tag: Option<String>,
    /// Include archived memories
    #[arg(long)]
    pub archived: bool,
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    pub id: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub summary: Option<String>,
    #[arg(long)]
    pub content: Option<String>,
    #[arg(long)]
    pub category: Option<Category>,
    #[arg(long)]
    pub scope: Option<String>,
    #[arg(long)]
    pub importance: Option<Importance>,
    /// Replaces the whole tag set
    #[arg(long, value_delimiter = ',')]
    pub tags: Option<Vec<String>>,
    #[arg(long)]
    pub supersedes: Option<String>,
}

impl From<WriteArgs> for WriteRequest {
    fn from(args: WriteArgs) -> Self {
        Self {
            title: args.title,
            summary: args.summary,
            content: args.content,
            category: args.category,
            scope: args.scope,
            importance: args.importance,
            tags: args.tags,
            supersedes: args.supersedes,
        }
    }
}

impl From<UpdateArgs> for MemoryUpdate {
    fn from(args: UpdateArgs) -> Self {
        Self {
            title: args.title,
            summary: args.summary,
            content: args.content,
            category: args.category,
            scope: args.scope,
            importance: args.importance,
            tags: args.tags,
            supersedes: args.supersedes,
        }
    }
}

impl From<ListArgs> for ListFilter {
    fn from(args: ListArgs) -> Self {
        Self {
            category: args.category,
            importance: args.importance,
            tag: args.tag,
            include_archived: args.archived,
            limit: args.limit,
        }
    }
}

/// Run one command against the store rooted by `config`.
pub async fn execute(command: Command, config: MemkeepConfig) -> Result<Value> {
    if let Command::Model {
        action: ModelAction::Download,
    } = command
    {
        return payload(model::model_download(&config.embedding).await?);
    }

    let service = MemoryService::open(config)?;
    let result = dispatch(&service, command).await;
    if let Err(e) = service.close() {
        tracing::warn!(error = %e, "failed to close store");
    }
    result
}

async fn dispatch(service: &MemoryService, command: Command) -> Result<Value> {
    match command {
        Command::Init => payload(service.init().await?),
        Command::Write(args) => payload(json!({ "memory": service.write(args.into()).await? })),
        Command::Search(args) => payload(service.search(&args.query.join(" "), args.limit).await?),
        Command::Quick(args) => payload(service.quick(&args.query.join(" "), args.limit)?),
        Command::Get { id } => payload(json!({ "memory": service.get(&id)? })),
        Command::List(args) => {
            let memories = service.list(&args.into())?;
            payload(json!({ "count": memories.len(), "memories": memories }))
        }
        Command::Stats => payload(service.stats()?),
        Command::Backend => payload(service.backend().await?),
        Command::Update(args) => {
            let id = args.id.clone();
            payload(json!({ "memory": service.update(&id, args.into()).await? }))
        }
        Command::Link {
            source,
            target,
            link_type,
        } => payload(json!({ "link": service.link(&source, &target, link_type)? })),
        Command::Archive { id } => payload(json!({ "memory": service.archive(&id)? })),
        Command::Delete { id } => payload(service.delete(&id)?),
        Command::Candidates => {
            let candidates = service.candidates()?;
            payload(json!({ "count": candidates.len(), "candidates": candidates }))
        }
        Command::Export => payload(service.export_all()?),
        Command::Rebuild => payload(service.rebuild().await?),
        Command::Model { .. } => anyhow::bail!("model commands do not open the store"),
    }
}

/// Serialize `value` and mark it successful. Non-object payloads go under `data`.
pub fn payload<T: Serialize>(value: T) -> Result<Value> {
    let value = serde_json::to_value(value)?;
    Ok(match value {
        Value::Object(mut map) => {
            map.insert("success".into(), Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "success": true, "data": other }),
    })
}

/// Failure payload with the error chain cut to [`MAX_ERROR_CHARS`].
pub fn error_payload(err: &anyhow::Error) -> Value {
    json!({ "success": false, "error": bounded(&format!("{err:#}")) })
}

fn bounded(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_CHARS) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_write_with_tags() {
        let cli = Cli::try_parse_from([
            "memkeep", "write", "--title", "JWT", "--summary", "tokens", "--tags", "auth,jwt",
            "--category", "arch",
        ])
        .unwrap();
        match cli.command {
            Command::Write(args) => {
                assert_eq!(args.tags, vec!["auth", "jwt"]);
                assert_eq!(args.category, Some(Category::Architecture));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn search_keeps_flags_in_query() {
        let cli = Cli::try_parse_from(["memkeep", "search", "jwt", "--include-archive"]).unwrap();
        match cli.command {
            Command::Search(args) => assert_eq!(args.query.join(" "), "jwt --include-archive"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn link_type_defaults_to_related() {
        let cli = Cli::try_parse_from(["memkeep", "link", "mem-001", "mem-002"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Link {
                link_type: LinkType::Related,
                ..
            }
        ));
    }

    #[test]
    fn payload_marks_success() {
        let v = payload(json!({ "id": "mem-001" })).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["id"], "mem-001");
        let v = payload(vec![1, 2]).unwrap();
        assert_eq!(v["data"][1], 2);
    }

    #[test]
    fn error_payload_is_bounded() {
        let err = anyhow::anyhow!("x".repeat(2000));
        let v = error_payload(&err);
        assert_eq!(v["success"], false);
        let msg = v["error"].as_str().unwrap();
        assert_eq!(msg.chars().count(), MAX_ERROR_CHARS + 3);
    }

    #[tokio::test]
    async fn execute_write_then_get() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = MemkeepConfig::for_root(tmp.path());
        config.embedding.provider = "none".into();

        let cli = Cli::try_parse_from(["memkeep", "write", "--title", "Retry", "--summary", "Linear backoff"]).unwrap();
        let written = execute(cli.command, config.clone()).await.unwrap();
        assert_eq!(written["memory"]["id"], "mem-001");

        let cli = Cli::try_parse_from(["memkeep", "get", "mem-001"]).unwrap();
        let got = execute(cli.command, config).await.unwrap();
        assert_eq!(got["memory"]["access_count"], 1);
    }
}
