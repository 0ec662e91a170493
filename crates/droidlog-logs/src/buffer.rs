use std::collections::VecDeque;

use droidlog_types::{ArcLogEntry, LogEntry, Priority};

/// Upper bound on the slots reserved up front for a large capacity
const PREALLOCATE_LIMIT: usize = 4096;

/// Capped, ordered store of shared log entries
///
/// Entries are appended at the tail in arrival order. When an append batch
/// pushes the length past the capacity, the oldest entries are removed from
/// the head in a single drain. A capacity of zero means unbounded.
#[derive(Clone, Debug, Default)]
pub struct EntryBuffer {
    /// Internal storage - shared entries, so both views see one selection flag
    entries: VecDeque<ArcLogEntry>,

    /// Maximum length (0 = unbounded)
    capacity: usize,
}

impl EntryBuffer {
    /// Create a new buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(PREALLOCATE_LIMIT)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_bounded(&self) -> bool {
        self.capacity > 0
    }

    /// Whether the buffer holds as many entries as its capacity allows
    pub fn is_full(&self) -> bool {
        self.is_bounded() && self.entries.len() >= self.capacity
    }

    /// Append a batch, then evict overflow from the head
    ///
    /// Returns the number of evicted entries.
    pub fn push_batch<I>(&mut self, batch: I) -> usize
    where
        I: IntoIterator<Item = ArcLogEntry>,
    {
        self.entries.extend(batch);
        self.evict_overflow()
    }

    fn evict_overflow(&mut self) -> usize {
        if !self.is_bounded() || self.entries.len() <= self.capacity {
            return 0;
        }
        let excess = self.entries.len() - self.capacity;
        self.entries.drain(..excess);
        excess
    }

    /// Drop head entries whose id is below `id`
    pub fn evict_older_than(&mut self, id: u64) -> usize {
        let stale = self.entries.iter().take_while(|e| e.id < id).count();
        self.entries.drain(..stale);
        stale
    }

    /// Keep only the entries matching `predicate`, returning how many were removed
    pub fn retain<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&LogEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|e| predicate(e));
        before - self.entries.len()
    }

    /// Insert entries older than the current head, given oldest first
    ///
    /// The caller must not push the length past the capacity.
    pub fn prepend(&mut self, older: Vec<ArcLogEntry>) {
        debug_assert!(!self.is_bounded() || self.entries.len() + older.len() <= self.capacity);
        for entry in older.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    /// Replace the whole content, keeping only the newest entries that fit
    pub fn replace(&mut self, entries: Vec<ArcLogEntry>) -> usize {
        self.entries.clear();
        self.push_batch(entries)
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn front(&self) -> Option<&ArcLogEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ArcLogEntry> + ExactSizeIterator {
        self.entries.iter()
    }

    /// Index of the entry with the given id (ids ascend from head to tail)
    pub fn position(&self, id: u64) -> Option<usize> {
        self.entries.binary_search_by_key(&id, |e| e.id).ok()
    }

    /// Get entry count per priority
    pub fn priority_counts(&self) -> PriorityCounts {
        let mut counts = PriorityCounts::default();
        for entry in &self.entries {
            counts.increment(entry.priority);
        }
        counts
    }
}

/// Counts per priority
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PriorityCounts {
    pub verbose: usize,
    pub debug: usize,
    pub info: usize,
    pub warn: usize,
    pub error: usize,
    pub fatal: usize,
}

impl PriorityCounts {
    fn increment(&mut self, priority: Priority) {
        match priority {
            Priority::Verbose => self.verbose += 1,
            Priority::Debug => self.debug += 1,
            Priority::Info => self.info += 1,
            Priority::Warn => self.warn += 1,
            Priority::Error => self.error += 1,
            Priority::Fatal => self.fatal += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.verbose + self.debug + self.info + self.warn + self.error + self.fatal
    }
}
