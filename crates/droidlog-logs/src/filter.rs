use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use droidlog_types::{ArcLogEntry, LogEntry};

use crate::buffer::EntryBuffer;

/// Maximum compiled size of a user regex
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// What the user typed into the filter box
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    pub pattern: String,
    pub use_regex: bool,
    pub match_case: bool,
}

impl FilterCriteria {
    /// Plain, case-insensitive substring filter
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    pub fn with_regex(mut self, use_regex: bool) -> Self {
        self.use_regex = use_regex;
        self
    }

    pub fn with_match_case(mut self, match_case: bool) -> Self {
        self.match_case = match_case;
        self
    }

    /// Check if the criteria accept every entry
    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }
}

#[derive(Clone, Debug)]
enum Matcher {
    All,
    /// Needle is already case-folded when `match_case` is false
    Substring { needle: String, match_case: bool },
    Regex(Regex),
}

/// Compiled filter for log entries
#[derive(Clone, Debug)]
pub struct CompiledFilter {
    criteria: FilterCriteria,
    matcher: Matcher,

    /// Compile error for an invalid regex
    error: Option<String>,
}

impl CompiledFilter {
    /// Compile criteria; an invalid regex degrades to matching everything
    pub fn new(criteria: FilterCriteria) -> Self {
        let (matcher, error) = if criteria.pattern.is_empty() {
            (Matcher::All, None)
        } else if criteria.use_regex {
            match compile_regex(&criteria.pattern, criteria.match_case) {
                Ok(re) => (Matcher::Regex(re), None),
                Err(e) => (Matcher::All, Some(e.to_string())),
            }
        } else {
            let needle = if criteria.match_case {
                criteria.pattern.clone()
            } else {
                fold_case(&criteria.pattern)
            };
            let match_case = criteria.match_case;
            (Matcher::Substring { needle, match_case }, None)
        };

        Self {
            criteria,
            matcher,
            error,
        }
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    /// Get the original pattern
    pub fn pattern(&self) -> &str {
        &self.criteria.pattern
    }

    /// False when the regex failed to compile
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Check if a log entry matches this filter
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.matches_text(&entry.message)
    }

    pub fn matches_text(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::All => true,
            Matcher::Substring {
                needle,
                match_case: true,
            } => text.contains(needle.as_str()),
            Matcher::Substring { needle, .. } => contains_folded(text, needle),
            Matcher::Regex(re) => re.is_match(text),
        }
    }
}

impl Default for CompiledFilter {
    fn default() -> Self {
        Self::new(FilterCriteria::default())
    }
}

/// Lowercase one character at a time
///
/// Unlike `str::to_lowercase` this ignores context (final sigma), so folding
/// commutes with taking substrings and `a ⊇ b` implies `fold(a) ⊇ fold(b)`.
fn fold_case(s: &str) -> String {
    s.chars().flat_map(char::to_lowercase).collect()
}

/// Whether the folded `text` contains an already folded `needle`
fn contains_folded(text: &str, needle: &str) -> bool {
    if text.is_ascii() && needle.is_ascii() {
        return needle.is_empty()
            || text
                .as_bytes()
                .windows(needle.len())
                .any(|w| w.eq_ignore_ascii_case(needle.as_bytes()));
    }
    fold_case(text).contains(needle)
}

fn compile_regex(pattern: &str, match_case: bool) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(!match_case)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .build()
}

/// Result of changing the filter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefilterOutcome {
    /// Criteria were identical, nothing was touched
    Unchanged,

    /// The previous filtered set was narrowed in place
    Reused { kept: usize, backfilled: usize },

    /// The filtered set was rebuilt from raw
    Rescanned { matched: usize },
}

/// Holds the baseline filter and keeps the filtered view in sync with it
///
/// The filtered buffer is always the newest `capacity` entries of raw that
/// match the baseline. That invariant is what makes narrowing the previous
/// result equivalent to a full rescan.
#[derive(Debug, Default)]
pub struct FilterEngine {
    current: CompiledFilter,
}

impl FilterEngine {
    pub fn new(criteria: FilterCriteria) -> Self {
        Self {
            current: compile_logged(criteria),
        }
    }

    pub fn filter(&self) -> &CompiledFilter {
        &self.current
    }

    pub fn criteria(&self) -> &FilterCriteria {
        self.current.criteria()
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.current.matches(entry)
    }

    /// Entries of a freshly appended batch that pass the baseline filter
    pub fn filter_batch<'a, I>(&self, batch: I) -> Vec<ArcLogEntry>
    where
        I: IntoIterator<Item = &'a ArcLogEntry>,
    {
        batch
            .into_iter()
            .filter(|e| self.current.matches(e))
            .cloned()
            .collect()
    }

    /// Whether everything `new` matches is guaranteed to be matched by `old`
    ///
    /// Only plain substring filters qualify. Switching from case-insensitive
    /// to case-sensitive narrows, so it may reuse. The opposite switch can
    /// widen the result (`"Conn"` then `"conn"` ignoring case matches more)
    /// and always forces a rescan. Containment is checked under the old
    /// filter's case semantics, using the same folding as the matcher.
    pub fn can_reuse(old: &FilterCriteria, new: &FilterCriteria) -> bool {
        if old.use_regex || new.use_regex {
            return false;
        }
        if old.match_case && !new.match_case {
            return false;
        }
        if old.match_case {
            new.pattern.contains(old.pattern.as_str())
        } else {
            fold_case(&new.pattern).contains(fold_case(&old.pattern).as_str())
        }
    }

    /// Swap in new criteria and bring `filtered` in line with them
    pub fn apply(
        &mut self,
        criteria: FilterCriteria,
        raw: &EntryBuffer,
        filtered: &mut EntryBuffer,
    ) -> RefilterOutcome {
        if criteria == *self.criteria() {
            return RefilterOutcome::Unchanged;
        }

        let reuse = Self::can_reuse(self.criteria(), &criteria);
        self.current = compile_logged(criteria);

        let outcome = if reuse {
            self.narrow(raw, filtered)
        } else {
            RefilterOutcome::Rescanned {
                matched: self.rescan(raw, filtered),
            }
        };
        debug!(pattern = %self.current.pattern(), ?outcome, "Filter applied");
        outcome
    }

    /// Rebuild `filtered` from raw with the current filter
    pub fn rescan(&self, raw: &EntryBuffer, filtered: &mut EntryBuffer) -> usize {
        let limit = if filtered.is_bounded() {
            filtered.capacity()
        } else {
            usize::MAX
        };

        let mut matched: Vec<ArcLogEntry> = raw
            .iter()
            .rev()
            .filter(|e| self.current.matches(e))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();

        let count = matched.len();
        filtered.replace(matched);
        count
    }

    fn narrow(&self, raw: &EntryBuffer, filtered: &mut EntryBuffer) -> RefilterOutcome {
        let was_full = filtered.is_full();
        let old_head = filtered.front().map(|e| e.id);

        filtered.retain(|e| self.current.matches(e));
        let kept = filtered.len();

        if !was_full {
            return RefilterOutcome::Reused {
                kept,
                backfilled: 0,
            };
        }

        // The old view was cut off by the cap, so raw may hold older matches
        let Some(head) = old_head.and_then(|id| raw.position(id)) else {
            return RefilterOutcome::Rescanned {
                matched: self.rescan(raw, filtered),
            };
        };

        let room = filtered.capacity() - kept;
        let mut older: Vec<ArcLogEntry> = raw
            .iter()
            .take(head)
            .rev()
            .filter(|e| self.current.matches(e))
            .take(room)
            .cloned()
            .collect();
        older.reverse();

        let backfilled = older.len();
        filtered.prepend(older);
        RefilterOutcome::Reused { kept, backfilled }
    }
}

fn compile_logged(criteria: FilterCriteria) -> CompiledFilter {
    let filter = CompiledFilter::new(criteria);
    if let Some(error) = filter.error() {
        warn!(pattern = %filter.pattern(), %error, "Invalid filter regex, matching everything");
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use droidlog_types::Priority;
    use rand::Rng;
    use rand::seq::IndexedRandom;
    use std::sync::Arc;

    fn entry(id: u64, message: &str) -> ArcLogEntry {
        let mut entry = LogEntry::new(
            Default::default(),
            1,
            1,
            Priority::Info,
            "Tag",
            message,
        );
        entry.id = id;
        Arc::new(entry)
    }

    fn raw_buffer(messages: &[&str]) -> EntryBuffer {
        let mut raw = EntryBuffer::new(0);
        raw.push_batch(
            messages
                .iter()
                .enumerate()
                .map(|(i, m)| entry(i as u64, m)),
        );
        raw
    }

    fn ids(buffer: &EntryBuffer) -> Vec<u64> {
        buffer.iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_substring_case_insensitive() {
        let filter = CompiledFilter::new(FilterCriteria::new("error"));
        assert!(filter.matches_text("An ERROR occurred"));
        assert!(!filter.matches_text("everything is fine"));
    }

    #[test]
    fn test_case_folding_is_per_character() {
        // Whole-string lowercasing turns a final capital sigma into 'ς'
        let filter = CompiledFilter::new(FilterCriteria::new("σ"));
        assert!(filter.matches_text("ΑΣ"));
        assert!(CompiledFilter::new(FilterCriteria::new("ΑΣ")).matches_text("ασ"));
        assert!(!CompiledFilter::new(FilterCriteria::new("x")).matches_text("ΑΣ"));
    }

    #[test]
    fn test_ascii_fast_path_matches_folding() {
        let filter = CompiledFilter::new(FilterCriteria::new("WaRn"));
        assert!(filter.matches_text("a warning"));
        assert!(!filter.matches_text("war"));
        assert!(CompiledFilter::new(FilterCriteria::new("")).matches_text("anything"));
    }

    #[test]
    fn test_unicode_narrowing_matches_full_rescan() {
        let raw = raw_buffer(&["ΑΣ"]);
        let mut filtered = EntryBuffer::new(0);
        let mut engine = FilterEngine::new(FilterCriteria::new("σ"));
        engine.rescan(&raw, &mut filtered);
        assert_eq!(ids(&filtered), vec![0]);

        let narrowed = FilterCriteria::new("Σ").with_match_case(true);
        let outcome = engine.apply(narrowed.clone(), &raw, &mut filtered);
        assert!(matches!(outcome, RefilterOutcome::Reused { kept: 1, .. }));

        let mut expected = EntryBuffer::new(0);
        FilterEngine::new(narrowed).rescan(&raw, &mut expected);
        assert_eq!(ids(&filtered), ids(&expected));
    }

    #[test]
    fn test_substring_match_case() {
        let filter = CompiledFilter::new(FilterCriteria::new("Error").with_match_case(true));
        assert!(filter.matches_text("Error here"));
        assert!(!filter.matches_text("error here"));
    }

    #[test]
    fn test_regex_filter() {
        let filter = CompiledFilter::new(FilterCriteria::new(r"^conn\w+ \d+$").with_regex(true));
        assert!(filter.is_valid());
        assert!(filter.matches_text("CONNECTED 42"));
        assert!(!filter.matches_text("connected now"));

        let strict = CompiledFilter::new(
            FilterCriteria::new("conn")
                .with_regex(true)
                .with_match_case(true),
        );
        assert!(!strict.matches_text("CONNECTED"));
    }

    #[test]
    fn test_invalid_regex_matches_everything() {
        let filter = CompiledFilter::new(FilterCriteria::new("(unclosed").with_regex(true));
        assert!(!filter.is_valid());
        assert!(filter.error().is_some());
        assert!(filter.matches_text("anything"));
    }

    #[test]
    fn test_empty_pattern_matches_everything() {
        let filter = CompiledFilter::new(FilterCriteria::new("").with_regex(true));
        assert!(filter.is_valid());
        assert!(filter.matches_text(""));
    }

    #[test]
    fn test_filter_uses_message() {
        let filter = CompiledFilter::new(FilterCriteria::new("Tag"));
        assert!(!filter.matches(&entry(0, "no match")));
        assert!(filter.matches(&entry(0, "Tag in message")));
    }

    #[test]
    fn test_can_reuse() {
        let plain = |p: &str| FilterCriteria::new(p);
        let cased = |p: &str| FilterCriteria::new(p).with_match_case(true);

        assert!(FilterEngine::can_reuse(&plain("conn"), &plain("connect")));
        assert!(FilterEngine::can_reuse(&plain("CONN"), &plain("xconnect")));
        assert!(FilterEngine::can_reuse(&plain(""), &plain("x")));
        assert!(!FilterEngine::can_reuse(&plain("connect"), &plain("conn")));

        assert!(FilterEngine::can_reuse(&cased("conn"), &cased("connect")));
        assert!(!FilterEngine::can_reuse(&cased("Conn"), &cased("connect")));

        // Tightening case is a narrowing, relaxing it is not
        assert!(FilterEngine::can_reuse(&plain("conn"), &cased("Connect")));
        assert!(!FilterEngine::can_reuse(&cased("conn"), &plain("connect")));

        assert!(!FilterEngine::can_reuse(&plain("a").with_regex(true), &plain("ab")));
        assert!(!FilterEngine::can_reuse(&plain("a"), &plain("ab").with_regex(true)));
    }

    #[test]
    fn test_apply_identical_is_unchanged() {
        let raw = raw_buffer(&["a", "b"]);
        let mut filtered = EntryBuffer::new(0);
        let mut engine = FilterEngine::new(FilterCriteria::new("a"));
        engine.rescan(&raw, &mut filtered);

        let outcome = engine.apply(FilterCriteria::new("a"), &raw, &mut filtered);
        assert_eq!(outcome, RefilterOutcome::Unchanged);
        assert_eq!(ids(&filtered), vec![0]);
    }

    #[test]
    fn test_apply_narrowing_reuses() {
        let raw = raw_buffer(&["connect", "conn lost", "disconnect", "other"]);
        let mut filtered = EntryBuffer::new(0);
        let mut engine = FilterEngine::new(FilterCriteria::new("conn"));
        engine.rescan(&raw, &mut filtered);
        assert_eq!(ids(&filtered), vec![0, 1, 2]);

        let outcome = engine.apply(FilterCriteria::new("connect"), &raw, &mut filtered);
        assert_eq!(
            outcome,
            RefilterOutcome::Reused {
                kept: 2,
                backfilled: 0
            }
        );
        assert_eq!(ids(&filtered), vec![0, 2]);
    }

    #[test]
    fn test_apply_widening_rescans() {
        let raw = raw_buffer(&["connect", "conn lost", "other"]);
        let mut filtered = EntryBuffer::new(0);
        let mut engine = FilterEngine::new(FilterCriteria::new("connect"));
        engine.rescan(&raw, &mut filtered);

        let outcome = engine.apply(FilterCriteria::new("conn"), &raw, &mut filtered);
        assert_eq!(outcome, RefilterOutcome::Rescanned { matched: 2 });
        assert_eq!(ids(&filtered), vec![0, 1]);
    }

    #[test]
    fn test_narrowing_full_buffer_backfills() {
        let raw = raw_buffer(&["ab", "ab", "a", "ab", "a", "a"]);
        let mut filtered = EntryBuffer::new(3);
        let mut engine = FilterEngine::new(FilterCriteria::new("a"));
        engine.rescan(&raw, &mut filtered);
        assert_eq!(ids(&filtered), vec![3, 4, 5]);

        let outcome = engine.apply(FilterCriteria::new("ab"), &raw, &mut filtered);
        assert_eq!(
            outcome,
            RefilterOutcome::Reused {
                kept: 1,
                backfilled: 2
            }
        );
        assert_eq!(ids(&filtered), vec![0, 1, 3]);
    }

    #[test]
    fn test_rescan_respects_capacity() {
        let raw = raw_buffer(&["x"; 10]);
        let mut filtered = EntryBuffer::new(4);
        let engine = FilterEngine::new(FilterCriteria::new("x"));
        assert_eq!(engine.rescan(&raw, &mut filtered), 4);
        assert_eq!(ids(&filtered), vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_random_refilter_matches_full_rescan() {
        const ALPHABET: [&str; 4] = ["a", "b", "A", "B"];
        let mut rng = rand::rng();

        let random_text = |rng: &mut rand::rngs::ThreadRng, max: usize| -> String {
            let len = rng.random_range(0..=max);
            (0..len)
                .map(|_| *ALPHABET.choose(rng).unwrap_or(&"a"))
                .collect()
        };

        for _ in 0..200 {
            let size = rng.random_range(0..60);
            let messages: Vec<String> = (0..size).map(|_| random_text(&mut rng, 6)).collect();
            let refs: Vec<&str> = messages.iter().map(String::as_str).collect();
            let raw = raw_buffer(&refs);

            let capacity = rng.random_range(0..20);
            let mut filtered = EntryBuffer::new(capacity);
            let mut engine = FilterEngine::new(FilterCriteria::default());
            engine.rescan(&raw, &mut filtered);

            let mut pattern = String::new();
            for _ in 0..6 {
                // Mostly narrow by extending the pattern, sometimes jump anywhere
                if rng.random_bool(0.8) {
                    pattern.push_str(&random_text(&mut rng, 1));
                } else {
                    pattern = random_text(&mut rng, 2);
                }
                let criteria = FilterCriteria::new(pattern.clone())
                    .with_match_case(rng.random_bool(0.5));

                engine.apply(criteria.clone(), &raw, &mut filtered);

                let mut expected = EntryBuffer::new(capacity);
                FilterEngine::new(criteria).rescan(&raw, &mut expected);
                assert_eq!(ids(&filtered), ids(&expected));
            }
        }
    }
}
