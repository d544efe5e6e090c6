//! Core memory type definitions.
//!
//! Defines [`Category`], [`Importance`] and [`LinkType`] (the fixed vocabularies),
//! [`Memory`] (a full record with tags and outgoing links), and the input
//! shapes used by the write, update and list paths.

use serde::{Deserialize, Serialize};

/// The fixed set of memory categories. Each maps to an `exports/<category>/` directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// System structure, component boundaries, design decisions.
    Architecture,
    /// Concrete code-level how-to and gotchas.
    Implementation,
    /// Bugs, incidents and their resolutions.
    Issues,
    /// Reusable practices. The default.
    Patterns,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Self::Architecture,
        Self::Implementation,
        Self::Issues,
        Self::Patterns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architecture => "architecture",
            Self::Implementation => "implementation",
            Self::Issues => "issues",
            Self::Patterns => "patterns",
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Self::Patterns
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    /// Accepts full names and the `arch`/`impl` abbreviations.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "architecture" | "arch" => Ok(Self::Architecture),
            "implementation" | "impl" => Ok(Self::Implementation),
            "issues" | "issue" => Ok(Self::Issues),
            "patterns" | "pattern" => Ok(Self::Patterns),
            _ => Err(format!("unknown category: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    High,
    Medium,
    Low,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl Default for Importance {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Importance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("unknown importance: {s}")),
        }
    }
}

/// Relation carried by a directed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Related,
    Supersedes,
    Implements,
    References,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::Supersedes => "supersedes",
            Self::Implements => "implements",
            Self::References => "references",
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "related" => Ok(Self::Related),
            "supersedes" => Ok(Self::Supersedes),
            "implements" => Ok(Self::Implements),
            "references" => Ok(Self::References),
            _ => Err(format!("unknown link type: {s}")),
        }
    }
}

/// A directed edge from a memory to another memory or an external key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub source_id: String,
    /// Another memory id, or an external identifier such as a work-item key.
    pub target_id: String,
    pub link_type: LinkType,
    pub created_at: String,
}

/// A memory record with its tags and outgoing links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// `mem-NNN`, or `mem-<unix-millis>` when sequential allocation failed.
    pub id: String,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub category: Category,
    pub scope: String,
    pub importance: Importance,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    pub accessed_at: Option<String>,
    pub access_count: u32,
    /// Id of an older memory this one replaces.
    pub supersedes: Option<String>,
    pub archived: bool,
    /// Where the markdown mirror of this memory was last written.
    pub export_path: Option<String>,
    /// Lowercase, sorted.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
}

/// Input to the create path.
///
/// `id`, `created_at`, `accessed_at`, `access_count` and `archived` are only
/// set by the import path, which reproduces records exactly.
#[derive(Debug, Clone, Default)]
pub struct NewMemory {
    pub id: Option<String>,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub category: Category,
    pub scope: String,
    pub importance: Importance,
    pub tags: Vec<String>,
    pub supersedes: Option<String>,
    pub created_at: Option<String>,
    pub accessed_at: Option<String>,
    pub access_count: u32,
    pub archived: bool,
}

/// Partial update. `None` fields are left untouched; `tags` replaces the whole set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryUpdate {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub category: Option<Category>,
    pub scope: Option<String>,
    pub importance: Option<Importance>,
    pub tags: Option<Vec<String>>,
    pub supersedes: Option<String>,
}

impl MemoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.summary.is_none()
            && self.content.is_none()
            && self.category.is_none()
            && self.scope.is_none()
            && self.importance.is_none()
            && self.tags.is_none()
            && self.supersedes.is_none()
    }

    /// True when the canonical embedding text changes.
    pub fn affects_content(&self) -> bool {
        self.title.is_some()
            || self.summary.is_some()
            || self.content.is_some()
            || self.tags.is_some()
            || self.category.is_some()
    }
}

/// Filters for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub category: Option<Category>,
    pub importance: Option<Importance>,
    pub tag: Option<String>,
    pub include_archived: bool,
    pub limit: Option<usize>,
}

/// Lowercase, trim, drop empties and duplicates, sort.
pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
