use regex::bytes::{Regex, RegexBuilder};
use regex_syntax::hir::{Hir, HirKind};

use super::{parse, ScanCounts, ScanError};

/// Where a single pattern next matches, as far as the scan has looked.
#[derive(Debug, Clone, Copy)]
enum Lookahead {
    Unknown,
    Exhausted,
    At(usize, usize),
}

#[derive(Debug)]
pub(super) struct ReferenceMatcher {
    combined: Option<Regex>,
    individual: Vec<Regex>,
}

impl ReferenceMatcher {
    pub(super) fn new(patterns: &[String]) -> Result<Self, ScanError> {
        let individual = patterns
            .iter()
            .map(|pattern| build(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        let combined = if patterns.is_empty() {
            None
        } else {
            let branches = patterns
                .iter()
                .map(|pattern| parse(pattern).map(without_captures))
                .collect::<Result<Vec<_>, _>>()?;
            Some(build(&Hir::alternation(branches).to_string())?)
        };
        Ok(Self {
            combined,
            individual,
        })
    }

    pub(super) fn scan(&self, data: &[u8], counts: &mut ScanCounts) -> Result<(), ScanError> {
        let Some(combined) = &self.combined else {
            return Ok(());
        };
        let mut lookahead = vec![Lookahead::Unknown; self.individual.len()];
        for found in combined.find_iter(data) {
            let index = self
                .attribute(data, found.start(), found.end(), &mut lookahead)
                .ok_or_else(|| ScanError::Unattributed {
                    start: found.start(),
                    end: found.end(),
                    text: String::from_utf8_lossy(found.as_bytes()).into_owned(),
                })?;
            counts.record(index)?;
        }
        Ok(())
    }

    /// First pattern whose own leftmost match from `start` is exactly `start..end`.
    fn attribute(
        &self,
        data: &[u8],
        start: usize,
        end: usize,
        lookahead: &mut [Lookahead],
    ) -> Option<usize> {
        for (index, regex) in self.individual.iter().enumerate() {
            let next = match lookahead[index] {
                Lookahead::At(next_start, next_end) if next_start >= start => {
                    Some((next_start, next_end))
                }
                Lookahead::Exhausted => None,
                Lookahead::Unknown | Lookahead::At(..) => {
                    let found = regex.find_at(data, start).map(|m| (m.start(), m.end()));
                    lookahead[index] = match found {
                        Some((s, e)) => Lookahead::At(s, e),
                        None => Lookahead::Exhausted,
                    };
                    found
                }
            };
            if next == Some((start, end)) {
                return Some(index);
            }
        }
        None
    }
}

fn build(pattern: &str) -> Result<Regex, ScanError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|error| ScanError::InvalidPattern {
            pattern: pattern.to_string(),
            message: error.to_string(),
        })
}

/// Same language as `hir`, with every capture group made a plain group so
/// branches from different patterns never clash on group names.
fn without_captures(hir: Hir) -> Hir {
    match hir.into_kind() {
        HirKind::Capture(capture) => without_captures(*capture.sub),
        HirKind::Concat(subs) => Hir::concat(subs.into_iter().map(without_captures).collect()),
        HirKind::Alternation(subs) => {
            Hir::alternation(subs.into_iter().map(without_captures).collect())
        }
        HirKind::Repetition(mut repetition) => {
            repetition.sub = Box::new(without_captures(*repetition.sub));
            Hir::repetition(repetition)
        }
        HirKind::Empty => Hir::empty(),
        HirKind::Literal(literal) => Hir::literal(literal.0),
        HirKind::Class(class) => Hir::class(class),
        HirKind::Look(look) => Hir::look(look),
    }
}
