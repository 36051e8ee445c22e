//! Keyword group configuration (`keywords.json`).
//!
//! Group order in the file decides pattern order, and pattern order decides
//! which pattern a match is attributed to, so groups are kept as an ordered
//! list rather than a map.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::scanner::{KeywordScanner, ScanError};

#[derive(Debug, thiserror::Error)]
pub enum KeywordError {
    #[error("failed to read keyword config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid keyword config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordGroup {
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Search-engine query lists keyed by market, e.g. `queries_dach`.
    #[serde(flatten)]
    pub queries: BTreeMap<String, Vec<String>>,
}

impl KeywordGroup {
    pub fn queries_for(&self, market: &str) -> &[String] {
        self.queries
            .get(&format!("queries_{market}"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordConfig {
    groups: Vec<(String, KeywordGroup)>,
}

impl KeywordConfig {
    pub fn new(groups: Vec<(String, KeywordGroup)>) -> Self {
        Self { groups }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, KeywordError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn load(path: &Path) -> Result<Self, KeywordError> {
        let bytes = std::fs::read(path).map_err(|source| KeywordError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    pub fn groups(&self) -> &[(String, KeywordGroup)] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&KeywordGroup> {
        self.groups
            .iter()
            .find(|(group_name, _)| group_name == name)
            .map(|(_, group)| group)
    }

    /// Every pattern of every group, in file order.
    pub fn patterns(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|(_, group)| group.patterns.iter().cloned())
            .collect()
    }
}

impl<'de> Deserialize<'de> for KeywordConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct GroupsVisitor;

        impl<'de> Visitor<'de> for GroupsVisitor {
            type Value = KeywordConfig;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of keyword group names to groups")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut groups = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, group)) = map.next_entry::<String, KeywordGroup>()? {
                    groups.push((name, group));
                }
                Ok(KeywordConfig { groups })
            }
        }

        deserializer.deserialize_map(GroupsVisitor)
    }
}

/// Keyword config and compiled scanner, each built at most once on first use.
#[derive(Debug)]
pub struct LazyScanner {
    source: PathBuf,
    config: OnceCell<KeywordConfig>,
    scanner: OnceCell<KeywordScanner>,
}

impl LazyScanner {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            config: OnceCell::new(),
            scanner: OnceCell::new(),
        }
    }

    pub fn config(&self) -> Result<&KeywordConfig, KeywordError> {
        self.config
            .get_or_try_init(|| KeywordConfig::load(&self.source))
    }

    pub fn scanner(&self) -> Result<&KeywordScanner, KeywordError> {
        self.scanner.get_or_try_init(|| {
            let patterns = self.config()?.patterns();
            Ok(KeywordScanner::compile(patterns)?)
        })
    }
}
