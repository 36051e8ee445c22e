use std::sync::Mutex;

use regex_automata::meta::{Cache, Regex};
use regex_automata::util::iter::Searcher;
use regex_automata::util::syntax;
use regex_automata::{Input, MatchKind};

use super::{ScanCounts, ScanError};

/// One automaton over all patterns. Searches need mutable scratch space, so
/// concurrent scans queue on the cache lock.
#[derive(Debug)]
pub(super) struct AcceleratedMatcher {
    regex: Regex,
    scratch: Mutex<Cache>,
}

impl AcceleratedMatcher {
    pub(super) fn new(patterns: &[String]) -> Result<Self, ScanError> {
        let regex = Regex::builder()
            .syntax(syntax::Config::new().case_insensitive(true).utf8(false))
            .configure(
                Regex::config()
                    .match_kind(MatchKind::LeftmostFirst)
                    .utf8_empty(false),
            )
            .build_many(patterns)
            .map_err(|error| ScanError::EngineUnavailable(error.to_string()))?;
        let scratch = Mutex::new(regex.create_cache());
        Ok(Self { regex, scratch })
    }

    pub(super) fn scan(&self, data: &[u8], counts: &mut ScanCounts) -> Result<(), ScanError> {
        let mut cache = self.scratch.lock().map_err(|_| ScanError::Poisoned)?;
        let mut searcher = Searcher::new(Input::new(data));
        while let Some(found) =
            searcher.advance(|input| Ok(self.regex.search_with(&mut cache, input)))
        {
            counts.record(found.pattern().as_usize())?;
        }
        Ok(())
    }
}
