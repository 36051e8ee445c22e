//! Identifier normalization and local cache addressing.
//!
//! Identifiers are hierarchical `planId/siteId/stepName[-index]` strings. They
//! arrive from operators in many shapes: Windows paths, full artifact keys,
//! cache paths whose timestamp colons were rewritten to dashes. `normalize`
//! folds all of those back into one canonical form.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::storage_keys::plan_part_key;

static MANGLED_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"T(\d+)-(\d+)-([.\d]+)Z").expect("timestamp repair pattern should compile")
});

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Everything before the last segment, if there is more than one segment.
    pub fn parent(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(parent, _)| parent)
    }

    pub fn leaf(&self) -> &str {
        self.0
            .rsplit_once('/')
            .map(|(_, leaf)| leaf)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier '{id}' does not name a step (expected <plan>/<part>-<index>)")]
    NotAStep { id: String },
}

/// Canonicalize a path-like identifier.
///
/// Never fails: malformed input is passed through as far as it can be.
pub fn normalize(path: &str) -> Identifier {
    let mut id = path.replace('\\', "/");
    loop {
        let trimmed = id.trim_matches('/');
        match trimmed.rsplit_once('/') {
            Some((parent, leaf)) if is_artifact_file(leaf) => id = parent.to_string(),
            None if is_artifact_file(trimmed) => id = String::new(),
            _ => {
                id = trimmed.to_string();
                break;
            }
        }
    }

    let repaired = MANGLED_TIMESTAMP.replace_all(&id, "T${1}:${2}:${3}Z");
    Identifier(repaired.trim_matches('/').to_string())
}

/// Relative cache path for a key; colons are not portable in file names.
pub fn to_local_path(id: &str) -> String {
    id.replace(':', "-")
}

/// Turn an arbitrary string into something usable as a VM hostname.
pub fn sanitize_hostname(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());
    for ch in value.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
            ch
        } else {
            '-'
        };
        if mapped == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(mapped);
    }
    sanitized.trim_matches('-').to_string()
}

fn is_artifact_file(segment: &str) -> bool {
    segment.ends_with(".json")
}

/// A single visited step: `<plan>/<part>-<index>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRef {
    pub plan_id: String,
    pub part: String,
    pub index: usize,
}

impl StepRef {
    pub fn parse(id: &Identifier) -> Result<Self, IdentifierError> {
        let not_a_step = || IdentifierError::NotAStep {
            id: id.as_str().to_string(),
        };
        let plan_id = id.parent().ok_or_else(not_a_step)?;
        let (part, index) = id.leaf().rsplit_once('-').ok_or_else(not_a_step)?;
        let index = index.parse::<usize>().map_err(|_| not_a_step())?;
        if part.is_empty() {
            return Err(not_a_step());
        }

        Ok(Self {
            plan_id: plan_id.to_string(),
            part: part.to_string(),
            index,
        })
    }

    /// Key of the part description holding this step's target URLs.
    pub fn part_key(&self) -> String {
        plan_part_key(&self.plan_id, &self.part)
    }
}
