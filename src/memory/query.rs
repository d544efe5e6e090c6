//! Search query grammar.
//!
//! A query is a free mix of bare words, `"quoted phrases"`, `tag:`,
//! `category:` and `importance:` filters, the `--include-archive` flag and,
//! optionally, a memory id which turns the query into a similar-to lookup.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::memory::is_memory_id;
use crate::memory::types::{Category, Importance};

static PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]*)""#).expect("valid regex"));

const ARCHIVE_FLAGS: [&str; 3] = ["--include-archive", "--include-archived", "--archived"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedQuery {
    /// Bare words, in query order.
    pub terms: Vec<String>,
    pub phrases: Vec<String>,
    /// Conjunctive tag filter, lowercase.
    pub tags: Vec<String>,
    pub category: Option<Category>,
    pub importance: Option<Importance>,
    pub include_archived: bool,
    /// Set when the query names a memory id.
    pub similar_to: Option<String>,
}

impl ParsedQuery {
    /// True when there is nothing to match text against.
    pub fn has_text(&self) -> bool {
        !self.terms.is_empty() || !self.phrases.is_empty()
    }
}

pub fn parse_query(input: &str) -> ParsedQuery {
    let mut parsed = ParsedQuery::default();

    for cap in PHRASE_RE.captures_iter(input) {
        let phrase = cap[1].trim();
        if !phrase.is_empty() {
            parsed.phrases.push(phrase.to_string());
        }
    }
    let rest = PHRASE_RE.replace_all(input, " ");
    let tokens: Vec<&str> = rest.split_whitespace().collect();

    for (i, token) in tokens.iter().enumerate() {
        let lower = token.to_lowercase();

        if ARCHIVE_FLAGS.contains(&lower.as_str()) {
            parsed.include_archived = true;
        } else if let Some(tag) = lower.strip_prefix("tag:") {
            if !tag.is_empty() {
                parsed.tags.push(tag.to_string());
            }
        } else if let Some(value) = lower.strip_prefix("category:") {
            match value.parse() {
                Ok(c) => parsed.category = Some(c),
                Err(_) => parsed.terms.push(token.to_string()),
            }
        } else if let Some(value) = lower.strip_prefix("importance:") {
            match value.parse() {
                Ok(imp) => parsed.importance = Some(imp),
                Err(_) => parsed.terms.push(token.to_string()),
            }
        } else if is_memory_id(&lower) {
            if parsed.similar_to.is_none() {
                parsed.similar_to = Some(lower);
            }
        } else if lower == "to" && tokens.get(i + 1).is_some_and(|next| is_memory_id(&next.to_lowercase())) {
            // "similar to mem-001"
        } else {
            parsed.terms.push(token.to_string());
        }
    }

    parsed.tags.sort();
    parsed.tags.dedup();
    parsed
}

/// FTS5 MATCH expression: every term and phrase quoted, joined with `OR`.
pub fn fts_match_expression(parsed: &ParsedQuery) -> Option<String> {
    let parts: Vec<String> = parsed
        .phrases
        .iter()
        .chain(parsed.terms.iter())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" OR "))
    }
}
