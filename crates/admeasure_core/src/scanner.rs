//! Multi-pattern keyword counting over captured page text.
//!
//! Two engines sit behind one call signature:
//!
//! - [`ScanStrategy::Reference`]: one case-insensitive alternation over all
//!   patterns; every match span is re-checked against the individual patterns
//!   to attribute it. Slow, obviously correct, always available.
//! - [`ScanStrategy::Accelerated`]: a single-pass multi-pattern automaton that
//!   reports pattern ids directly. Its scratch space is shared, so scans
//!   through it are serialized.
//!
//! Both count leftmost-first, non-overlapping matches: at a given start the
//! earliest configured pattern wins and scanning resumes at the match end. A
//! pattern embedded in another therefore only counts where the longer one did
//! not already claim the text (or where it comes first in the config).

#[cfg(feature = "accelerated")]
mod accelerated;
mod reference;

use std::collections::BTreeMap;
use std::sync::Arc;

#[cfg(feature = "accelerated")]
use accelerated::AcceleratedMatcher;
use reference::ReferenceMatcher;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("invalid keyword pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("keyword pattern '{pattern}' can match the empty string")]
    EmptyMatch { pattern: String },
    #[error("none of the individual patterns match {text:?} at {start}..{end}")]
    Unattributed {
        start: usize,
        end: usize,
        text: String,
    },
    #[error("matcher reported pattern id {id}, but only {known} patterns are configured")]
    UnknownPatternId { id: usize, known: usize },
    #[error("accelerated engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("scanner scratch lock poisoned by a panicking scan")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStrategy {
    Reference,
    Accelerated,
}

/// Match counts, one per configured pattern, indexed like the pattern list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCounts {
    patterns: Arc<[String]>,
    counts: Vec<u64>,
}

impl ScanCounts {
    fn zeroed(patterns: Arc<[String]>) -> Self {
        let counts = vec![0; patterns.len()];
        Self { patterns, counts }
    }

    fn record(&mut self, index: usize) -> Result<(), ScanError> {
        let known = self.counts.len();
        let slot = self
            .counts
            .get_mut(index)
            .ok_or(ScanError::UnknownPatternId { id: index, known })?;
        *slot += 1;
        Ok(())
    }

    /// Count for the first pattern with exactly this text.
    pub fn get(&self, pattern: &str) -> Option<u64> {
        self.patterns
            .iter()
            .position(|candidate| candidate == pattern)
            .map(|index| self.counts[index])
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.patterns
            .iter()
            .map(String::as_str)
            .zip(self.counts.iter().copied())
    }

    pub fn non_zero(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.iter().filter(|(_, count)| *count > 0)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Pattern text to count; duplicate pattern texts are summed.
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        for (pattern, count) in self.iter() {
            *map.entry(pattern.to_string()).or_insert(0) += count;
        }
        map
    }
}

#[derive(Debug)]
enum Engine {
    Reference(ReferenceMatcher),
    #[cfg(feature = "accelerated")]
    Accelerated(AcceleratedMatcher),
}

#[derive(Debug)]
pub struct KeywordScanner {
    patterns: Arc<[String]>,
    engine: Engine,
}

impl KeywordScanner {
    /// Compile with the fastest engine this build can provide.
    pub fn compile<I, S>(patterns: I) -> Result<Self, ScanError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = validate_patterns(patterns)?;

        #[cfg(feature = "accelerated")]
        match AcceleratedMatcher::new(&patterns) {
            Ok(matcher) => {
                return Ok(Self {
                    patterns,
                    engine: Engine::Accelerated(matcher),
                })
            }
            Err(error) => tracing::warn!(
                component = "keyword_scanner",
                event = "accelerated_unavailable",
                %error,
                "using slow regex-based fallback"
            ),
        }

        #[cfg(not(feature = "accelerated"))]
        tracing::warn!(
            component = "keyword_scanner",
            event = "accelerated_unavailable",
            "built without the accelerated engine; using slow regex-based fallback"
        );

        let matcher = ReferenceMatcher::new(&patterns)?;
        Ok(Self {
            patterns,
            engine: Engine::Reference(matcher),
        })
    }

    /// Compile with a specific engine; used to cross-check the two.
    pub fn with_strategy<I, S>(patterns: I, strategy: ScanStrategy) -> Result<Self, ScanError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = validate_patterns(patterns)?;
        let engine = match strategy {
            ScanStrategy::Reference => Engine::Reference(ReferenceMatcher::new(&patterns)?),
            #[cfg(feature = "accelerated")]
            ScanStrategy::Accelerated => Engine::Accelerated(AcceleratedMatcher::new(&patterns)?),
            #[cfg(not(feature = "accelerated"))]
            ScanStrategy::Accelerated => {
                return Err(ScanError::EngineUnavailable(
                    "built without the `accelerated` feature".to_string(),
                ))
            }
        };
        Ok(Self { patterns, engine })
    }

    pub fn strategy(&self) -> ScanStrategy {
        match self.engine {
            Engine::Reference(_) => ScanStrategy::Reference,
            #[cfg(feature = "accelerated")]
            Engine::Accelerated(_) => ScanStrategy::Accelerated,
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn scan(&self, data: &[u8]) -> Result<ScanCounts, ScanError> {
        let mut counts = ScanCounts::zeroed(Arc::clone(&self.patterns));
        if self.patterns.is_empty() {
            return Ok(counts);
        }
        match &self.engine {
            Engine::Reference(matcher) => matcher.scan(data, &mut counts)?,
            #[cfg(feature = "accelerated")]
            Engine::Accelerated(matcher) => matcher.scan(data, &mut counts)?,
        }
        Ok(counts)
    }
}

fn validate_patterns<I, S>(patterns: I) -> Result<Arc<[String]>, ScanError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
    for pattern in &patterns {
        if parse(pattern)?.properties().minimum_len() == Some(0) {
            return Err(ScanError::EmptyMatch {
                pattern: pattern.clone(),
            });
        }
    }
    Ok(patterns.into())
}

/// Syntax tree of one pattern, parsed the way both engines read it.
fn parse(pattern: &str) -> Result<regex_syntax::hir::Hir, ScanError> {
    regex_syntax::ParserBuilder::new()
        .case_insensitive(true)
        .utf8(false)
        .build()
        .parse(pattern)
        .map_err(|error| ScanError::InvalidPattern {
            pattern: pattern.to_string(),
            message: error.to_string(),
        })
}
