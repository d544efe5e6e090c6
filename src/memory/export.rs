//! Markdown mirror of the store.
//!
//! Every memory has a human-readable file under the memory root:
//! `exports/<category>/<id>-<slug>.md`, or `archive/<id>-<slug>.md` once
//! archived. Files carry YAML front matter followed by fixed sections, and
//! the whole store can be rebuilt from them with [`rebuild_from_exports`].

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::db::Store;
use crate::error::StoreError;
use crate::memory::store::{
    create_memory, exists, load_memory, repair_id_counter, set_access, set_archived, set_export_path,
    update_memory,
};
use crate::memory::types::{Category, Importance, LinkType, Memory, MemoryUpdate, NewMemory};
use crate::memory::{is_memory_id, parse_id_number, relations};

pub const EXPORTS_DIR: &str = "exports";
pub const ARCHIVE_DIR: &str = "archive";

const MAX_SLUG_LEN: usize = 50;

/// Front matter of an exported file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrontMatter {
    id: String,
    title: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default = "default_scope")]
    scope: String,
    #[serde(default)]
    importance: Importance,
    created: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    accessed: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    access_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    supersedes: Option<String>,
}

fn default_category() -> String {
    Category::default().as_str().to_string()
}

fn default_scope() -> String {
    "project".into()
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// An exported file parsed back into record fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedMemory {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub category: Category,
    pub scope: String,
    pub importance: Importance,
    pub tags: Vec<String>,
    pub created_at: String,
    pub accessed_at: Option<String>,
    pub access_count: u32,
    pub supersedes: Option<String>,
    /// `(target, type)` pairs from the Related section.
    pub links: Vec<(String, LinkType)>,
}

/// Outcome of [`rebuild_from_exports`].
#[derive(Debug, Default, Serialize)]
pub struct RebuildReport {
    pub imported: Vec<String>,
    pub archived: usize,
    pub failed: Vec<RebuildFailure>,
    /// Allocator value after repair, when any sequential id was imported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_id: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RebuildFailure {
    pub path: String,
    pub error: String,
}

// ── Paths ─────────────────────────────────────────────────────────────────────

/// Lowercase, collapse non-alphanumeric runs to `-`, trim, cap length.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    let mut capped: String = slug.chars().take(MAX_SLUG_LEN).collect();
    while capped.ends_with('-') {
        capped.pop();
    }
    if capped.is_empty() {
        "untitled".into()
    } else {
        capped
    }
}

/// Path of the export file relative to the memory root, with `/` separators.
pub fn relative_export_path(memory: &Memory) -> String {
    let file = format!("{}-{}.md", memory.id, slugify(&memory.title));
    if memory.archived {
        format!("{ARCHIVE_DIR}/{file}")
    } else {
        format!("{EXPORTS_DIR}/{}/{file}", memory.category)
    }
}

fn absolute(memory_root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(memory_root.to_path_buf(), |path, part| path.join(part))
}

fn relative_to(memory_root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(memory_root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Create `exports/<category>/` for every category and `archive/`.
pub fn ensure_layout(memory_root: &Path) -> Result<()> {
    for category in Category::ALL {
        std::fs::create_dir_all(memory_root.join(EXPORTS_DIR).join(category.as_str()))?;
    }
    std::fs::create_dir_all(memory_root.join(ARCHIVE_DIR))?;
    Ok(())
}

// ── Render / parse ────────────────────────────────────────────────────────────

pub fn render_markdown(memory: &Memory) -> Result<String> {
    let front = FrontMatter {
        id: memory.id.clone(),
        title: memory.title.clone(),
        tags: memory.tags.clone(),
        category: memory.category.as_str().to_string(),
        scope: memory.scope.clone(),
        importance: memory.importance,
        created: memory.created_at.clone(),
        accessed: memory.accessed_at.clone(),
        access_count: memory.access_count,
        supersedes: memory.supersedes.clone(),
    };
    let yaml = serde_yaml::to_string(&front).context("failed to serialize front matter")?;

    let mut out = format!(
        "---\n{}---\n\n# {}\n\n## Summary\n\n{}\n",
        yaml,
        memory.title,
        escape_headings(memory.summary.trim())
    );

    let content = memory.content.trim();
    if !content.is_empty() && content != memory.summary.trim() {
        out.push_str(&format!("\n## Details\n\n{}\n", escape_headings(content)));
    }

    if !memory.links.is_empty() {
        out.push_str("\n## Related\n\n");
        for link in &memory.links {
            match link.link_type {
                LinkType::Related => out.push_str(&format!("- {}\n", link.target_id)),
                other => out.push_str(&format!("- {other}: {}\n", link.target_id)),
            }
        }
    }

    out.push_str(&format!("\n## History\n\n- created: {}\n", memory.created_at));
    if let Some(old) = &memory.supersedes {
        out.push_str(&format!("- supersedes: {old}\n"));
    }
    Ok(out)
}

/// Split `---` fenced front matter from the body.
fn split_front_matter(text: &str) -> Result<(&str, &str)> {
    let text = text.trim_start_matches('\u{feff}');
    let Some(rest) = text.strip_prefix("---") else {
        bail!("missing front matter");
    };
    let rest = rest.trim_start_matches([' ', '\t']);
    let rest = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
        .context("malformed front matter fence")?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Ok((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    bail!("unterminated front matter")
}

/// True for a line that reads as a `##` heading once leading backslashes are dropped.
fn is_heading_like(line: &str) -> bool {
    line.trim_start_matches('\\').starts_with("##")
}

/// Backslash-prefix heading-like lines of free text so they cannot open a section.
fn escape_headings(text: &str) -> String {
    text.lines()
        .map(|line| {
            if is_heading_like(line) {
                format!("\\{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescape_heading(line: &str) -> &str {
    match line.strip_prefix('\\') {
        Some(rest) if is_heading_like(rest) => rest,
        _ => line,
    }
}

fn section_text(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|line| unescape_heading(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

pub fn parse_markdown(text: &str) -> Result<ExportedMemory> {
    let (yaml, body) = split_front_matter(text)?;
    let front: FrontMatter = serde_yaml::from_str(yaml).context("invalid front matter")?;
    if !is_memory_id(&front.id) {
        bail!("invalid memory id in front matter: {}", front.id);
    }
    let category: Category = front
        .category
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let lines: Vec<&str> = body.lines().map(|l| l.trim_end_matches('\r')).collect();
    let heading = |name: &str, line: &&str| line.trim_end() == name;

    let summary_at = lines.iter().position(|l| heading("## Summary", l));
    let history_at = lines.iter().rposition(|l| heading("## History", l));
    let details_at = summary_at.and_then(|s| {
        lines[s + 1..]
            .iter()
            .position(|l| heading("## Details", l))
            .map(|i| s + 1 + i)
    });
    let related_at = {
        let end = history_at.unwrap_or(lines.len());
        let start = details_at.or(summary_at).map(|i| i + 1).unwrap_or(0);
        lines[start.min(end)..end]
            .iter()
            .rposition(|l| heading("## Related", l))
            .map(|i| start.min(end) + i)
    };

    let next_after = |idx: usize| {
        [details_at, related_at, history_at]
            .into_iter()
            .flatten()
            .filter(|&h| h > idx)
            .min()
            .unwrap_or(lines.len())
    };

    let summary = summary_at
        .map(|s| section_text(&lines[s + 1..next_after(s)]))
        .unwrap_or_default();
    let content = match details_at {
        Some(d) => section_text(&lines[d + 1..next_after(d)]),
        None => summary.clone(),
    };

    let mut links = Vec::new();
    if let Some(r) = related_at {
        for line in &lines[r + 1..next_after(r)] {
            let Some(item) = line.trim().strip_prefix("- ") else {
                continue;
            };
            let item = item.trim();
            let (target, link_type) = match item.split_once(": ") {
                Some((kind, target)) => match kind.parse::<LinkType>() {
                    Ok(t) => (target.trim(), t),
                    Err(_) => (item, LinkType::Related),
                },
                None => (item, LinkType::Related),
            };
            if !target.is_empty() {
                links.push((target.to_string(), link_type));
            }
        }
    }

    Ok(ExportedMemory {
        id: front.id,
        title: front.title,
        summary,
        content,
        category,
        scope: front.scope,
        importance: front.importance,
        tags: front.tags,
        created_at: front.created,
        accessed_at: front.accessed,
        access_count: front.access_count,
        supersedes: front.supersedes,
        links,
    })
}

// ── Store operations ──────────────────────────────────────────────────────────

/// Write the memory's file at its current path and record that path.
///
/// A file left at a previous path (category change, retitle) is removed.
pub fn export_memory(store: &Store, memory_root: &Path, id: &str) -> Result<PathBuf> {
    let memory = load_memory(store, id)?.ok_or_else(|| StoreError::not_found(id))?;
    let relative = relative_export_path(&memory);
    let target = absolute(memory_root, &relative);

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, render_markdown(&memory)?)
        .with_context(|| format!("failed to write {}", target.display()))?;

    if let Some(previous) = memory.export_path.as_deref().filter(|p| *p != relative) {
        remove_file_if_exists(&absolute(memory_root, previous))?;
    }
    set_export_path(store, id, Some(&relative))?;
    tracing::debug!(id = %id, path = %relative, "export written");
    Ok(target)
}

/// Import one exported file.
///
/// An existing id is updated in place; otherwise a record is created with the
/// file's id. Files directly under `archive/` import as archived.
pub fn import_memory(store: &Store, memory_root: &Path, path: &Path) -> Result<Memory> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let doc = parse_markdown(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    let archived = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|name| name == ARCHIVE_DIR);

    if exists(store, &doc.id)? {
        update_memory(
            store,
            &doc.id,
            &MemoryUpdate {
                title: Some(doc.title.clone()),
                summary: Some(doc.summary.clone()),
                content: Some(doc.content.clone()),
                category: Some(doc.category),
                scope: Some(doc.scope.clone()),
                importance: Some(doc.importance),
                tags: Some(doc.tags.clone()),
                supersedes: doc.supersedes.clone(),
            },
        )?;
    } else {
        create_memory(
            store,
            &NewMemory {
                id: Some(doc.id.clone()),
                title: doc.title.clone(),
                summary: doc.summary.clone(),
                content: doc.content.clone(),
                category: doc.category,
                scope: doc.scope.clone(),
                importance: doc.importance,
                tags: doc.tags.clone(),
                supersedes: doc.supersedes.clone(),
                created_at: Some(doc.created_at.clone()),
                accessed_at: doc.accessed_at.clone(),
                access_count: doc.access_count,
                archived,
            },
        )?;
    }

    let mut links = doc.links.clone();
    if let Some(old) = &doc.supersedes {
        if !links.iter().any(|(target, _)| target == old) {
            links.push((old.clone(), LinkType::Supersedes));
        }
    }
    relations::replace_links(store, &doc.id, &links)?;
    set_access(store, &doc.id, doc.accessed_at.as_deref(), doc.access_count)?;
    set_archived(store, &doc.id, archived, Some(&relative_to(memory_root, path)))?;

    load_memory(store, &doc.id)?.ok_or_else(|| StoreError::not_found(&doc.id).into())
}

fn markdown_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();
    files
}

/// Rebuild the store from every file under `exports/<category>/` and `archive/`.
///
/// Files that fail to parse are reported and skipped. Afterwards the id
/// allocator is moved past the highest imported sequential id.
pub fn rebuild_from_exports(store: &Store, memory_root: &Path) -> Result<RebuildReport> {
    let mut dirs: Vec<PathBuf> = Category::ALL
        .iter()
        .map(|c| memory_root.join(EXPORTS_DIR).join(c.as_str()))
        .collect();
    dirs.push(memory_root.join(ARCHIVE_DIR));

    let mut report = RebuildReport::default();
    let mut max_id: Option<u64> = None;

    for path in dirs.iter().flat_map(|d| markdown_files(d)) {
        match import_memory(store, memory_root, &path) {
            Ok(memory) => {
                if memory.archived {
                    report.archived += 1;
                }
                if let Some(n) = parse_id_number(&memory.id) {
                    max_id = Some(max_id.map_or(n, |m| m.max(n)));
                }
                report.imported.push(memory.id);
            }
            Err(e) if e.downcast_ref::<StoreError>().is_some_and(StoreError::is_busy) => return Err(e),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable export");
                report.failed.push(RebuildFailure {
                    path: path.display().to_string(),
                    error: format!("{e:#}"),
                });
            }
        }
    }

    if let Some(max) = max_id {
        repair_id_counter(store, max)?;
        report.next_id = Some(max + 1);
    }
    tracing::info!(
        imported = report.imported.len(),
        failed = report.failed.len(),
        "rebuild from exports finished"
    );
    Ok(report)
}

/// Move the memory's file to `archive/` and set its archived flag.
///
/// The archive file is written first; if the flag update then fails the new
/// file is removed again, so flag and file location always agree.
pub fn archive_export(store: &Store, memory_root: &Path, id: &str) -> Result<PathBuf> {
    let memory = load_memory(store, id)?.ok_or_else(|| StoreError::not_found(id))?;
    let mut archived = memory.clone();
    archived.archived = true;

    let relative = relative_export_path(&archived);
    let target = absolute(memory_root, &relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, render_markdown(&archived)?)
        .with_context(|| format!("failed to write {}", target.display()))?;

    if let Err(e) = set_archived(store, id, true, Some(&relative)) {
        remove_file_if_exists(&target)?;
        return Err(e.into());
    }

    let previous = memory
        .export_path
        .as_deref()
        .map(|p| absolute(memory_root, p))
        .unwrap_or_else(|| absolute(memory_root, &relative_export_path(&memory)));
    if previous != target {
        if let Err(e) = remove_file_if_exists(&previous) {
            tracing::warn!(id = %id, path = %previous.display(), error = %e, "stale export left behind");
        }
    }
    tracing::info!(id = %id, path = %relative, "memory archived");
    Ok(target)
}

/// Remove the export file of `memory`, wherever it currently is.
pub fn remove_export(memory_root: &Path, memory: &Memory) -> Result<()> {
    if let Some(path) = &memory.export_path {
        remove_file_if_exists(&absolute(memory_root, path))?;
    }
    remove_file_if_exists(&absolute(memory_root, &relative_export_path(memory)))
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
