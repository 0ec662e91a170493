use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use droidlog_types::{ArcLogEntry, DeviceCapabilities, LogEntry, Priority};

use crate::buffer::{EntryBuffer, PriorityCounts};
use crate::error::{Result, SessionError};
use crate::filter::{FilterCriteria, FilterEngine, RefilterOutcome};
use crate::parser::LineParser;
use crate::producer::LineProducer;

/// Default raw buffer size
pub const DEFAULT_MAX_CACHED_ENTRIES: usize = 60_000;

/// Default filtered buffer size
pub const DEFAULT_MAX_DISPLAYED_ENTRIES: usize = 10_000;

/// Thread-safe inbox a producer writes raw lines into
#[derive(Clone, Debug, Default)]
pub struct LineSink {
    pending: Arc<Mutex<Vec<String>>>,
}

impl LineSink {
    /// Queue a line; `None` and empty lines are ignored
    pub fn on_data_received(&self, line: Option<&str>) {
        match line {
            Some(line) if !line.is_empty() => self.pending.lock().push(line.to_string()),
            _ => {}
        }
    }

    /// Take every queued line, leaving the inbox empty
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Raw buffer capacity (0 = unbounded)
    pub max_cached_entries: usize,

    /// Filtered buffer capacity (0 = unbounded)
    pub max_displayed_entries: usize,

    pub capabilities: DeviceCapabilities,
    pub filter: FilterCriteria,

    /// Tags to keep (empty = all)
    pub tags: HashSet<String>,

    /// Process to keep, when the device cannot filter by pid itself
    pub target_pid: Option<i32>,

    pub min_priority: Priority,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_cached_entries: DEFAULT_MAX_CACHED_ENTRIES,
            max_displayed_entries: DEFAULT_MAX_DISPLAYED_ENTRIES,
            capabilities: DeviceCapabilities::default(),
            filter: FilterCriteria::default(),
            tags: HashSet::new(),
            target_pid: None,
            min_priority: Priority::Verbose,
        }
    }
}

/// Notifications sent to session subscribers
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// A drain appended entries to the raw buffer
    RawEntriesAdded { added: usize, evicted: usize },

    /// Entries newly appended to the filtered buffer, oldest first
    FilteredEntriesAdded(Vec<ArcLogEntry>),

    /// The filter changed and the filtered buffer was rebuilt or narrowed
    FilteredEntriesReplaced(RefilterOutcome),

    ProducerConnected(String),
    ProducerDisconnected(String),

    /// Both buffers were emptied
    Cleared,
}

/// What one drain did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Lines taken from the sink
    pub lines: usize,
    pub parsed: usize,
    pub unparsable: usize,

    /// Lines rejected by the tag, pid or priority filters
    pub dropped: usize,

    pub raw_added: usize,
    pub raw_evicted: usize,
    pub filtered_added: usize,
}

/// Raw and filtered views of one device's log stream
///
/// Owned by the main thread. Producers only ever touch the [`LineSink`];
/// everything else happens in [`LogSession::drain`] and the setters.
pub struct LogSession {
    sink: LineSink,
    parser: LineParser,
    engine: FilterEngine,

    raw: EntryBuffer,
    filtered: EntryBuffer,

    /// Id given to the next entry entering raw
    next_id: u64,

    capabilities: DeviceCapabilities,
    tags: HashSet<String>,
    target_pid: Option<i32>,
    min_priority: Priority,

    producer: Option<Box<dyn LineProducer>>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl LogSession {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let SessionConfig {
            max_cached_entries,
            max_displayed_entries,
            capabilities,
            filter,
            tags,
            target_pid,
            min_priority,
        } = config;

        if max_cached_entries > 0 && max_displayed_entries > max_cached_entries {
            return Err(SessionError::InvalidConfig(format!(
                "max_displayed_entries ({max_displayed_entries}) exceeds max_cached_entries ({max_cached_entries})"
            )));
        }

        Ok(Self {
            sink: LineSink::default(),
            parser: LineParser::for_capabilities(&capabilities),
            engine: FilterEngine::new(filter),
            raw: EntryBuffer::new(max_cached_entries),
            filtered: EntryBuffer::new(max_displayed_entries),
            next_id: 0,
            capabilities,
            tags,
            target_pid,
            min_priority,
            producer: None,
            subscribers: Vec::new(),
        })
    }

    /// Handle for anything that wants to feed lines without being attached
    pub fn line_sink(&self) -> LineSink {
        self.sink.clone()
    }

    /// Receive notifications from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ========================================================================
    // Producer lifecycle
    // ========================================================================

    /// Start a producer feeding this session, replacing any attached one
    pub fn attach(&mut self, mut producer: Box<dyn LineProducer>) -> Result<()> {
        self.detach();

        producer.start(self.sink.clone())?;
        let name = producer.name().to_string();
        info!(producer = %name, "Producer attached");

        self.producer = Some(producer);
        self.emit(SessionEvent::ProducerConnected(name));
        Ok(())
    }

    /// Stop and forget the attached producer
    ///
    /// Lines it already delivered stay queued for the next drain.
    pub fn detach(&mut self) {
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
            self.disconnected(producer.name().to_string());
        }
    }

    /// Force-terminate the attached producer
    pub fn kill(&mut self) {
        if let Some(mut producer) = self.producer.take() {
            producer.kill();
            self.disconnected(producer.name().to_string());
        }
    }

    fn disconnected(&mut self, name: String) {
        info!(producer = %name, "Producer detached");
        self.emit(SessionEvent::ProducerDisconnected(name));
    }

    pub fn is_attached(&self) -> bool {
        self.producer.is_some()
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Move queued lines into the buffers; call once per tick
    pub fn drain(&mut self) -> DrainReport {
        // Sampled first so an exited producer's last lines are part of this batch
        let exited = self.producer.as_ref().is_some_and(|p| p.has_exited());

        let lines = self.sink.take();
        let mut report = DrainReport {
            lines: lines.len(),
            ..Default::default()
        };
        if !lines.is_empty() {
            self.ingest(&lines, &mut report);
        }

        if exited {
            self.detach();
        }
        report
    }

    fn ingest(&mut self, lines: &[String], report: &mut DrainReport) {
        let mut batch = Vec::with_capacity(lines.len());

        for line in lines {
            let mut entry = match self.parser.parse(line) {
                Ok(entry) => {
                    report.parsed += 1;
                    entry
                }
                Err(e) => {
                    report.unparsable += 1;
                    if !self.tags.is_empty() {
                        debug!(error = %e, "Dropping unparsable line while filtering by tag");
                        report.dropped += 1;
                        continue;
                    }
                    debug!(error = %e, line = %line, "Unparsable log line");
                    LogEntry::unparsed(line)
                }
            };

            if !self.accepts(&entry) {
                report.dropped += 1;
                continue;
            }

            entry.id = self.next_id;
            self.next_id += 1;
            batch.push(Arc::new(entry));
        }

        if batch.is_empty() {
            return;
        }

        let added = batch.len();
        let evicted = self.raw.push_batch(batch.iter().cloned());
        report.raw_added = added;
        report.raw_evicted = evicted;

        // Keep filtered inside raw, then append what survived the raw cap
        let oldest = self.raw.front().map_or(self.next_id, |e| e.id);
        self.filtered.evict_older_than(oldest);
        let mut matched = self
            .engine
            .filter_batch(batch.iter().filter(|e| e.id >= oldest));
        self.filtered.push_batch(matched.iter().cloned());

        let survived = matched.len().min(self.filtered.len());
        let new_entries = matched.split_off(matched.len() - survived);
        report.filtered_added = new_entries.len();

        self.emit(SessionEvent::RawEntriesAdded { added, evicted });
        if !new_entries.is_empty() {
            self.emit(SessionEvent::FilteredEntriesAdded(new_entries));
        }
    }

    /// Tag, pid and priority checks applied before an entry enters raw
    fn accepts(&self, entry: &LogEntry) -> bool {
        let unparsed = entry.is_unparsed();

        if let Some(pid) = self.target_pid {
            if !self.capabilities.supports_pid_filter && entry.pid != pid {
                return false;
            }
        }

        if !unparsed
            && !self.tags.is_empty()
            && !self.capabilities.supports_tag_filter
            && !self.tags.contains(&entry.tag)
        {
            return false;
        }

        unparsed || entry.priority >= self.min_priority
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Change the filter, narrowing the previous result when possible
    pub fn set_filter(&mut self, criteria: FilterCriteria) -> RefilterOutcome {
        let outcome = self.engine.apply(criteria, &self.raw, &mut self.filtered);
        if outcome != RefilterOutcome::Unchanged {
            self.emit(SessionEvent::FilteredEntriesReplaced(outcome));
        }
        outcome
    }

    /// Tags to keep; applies to lines drained from now on
    pub fn set_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
    }

    /// Process to keep; applies to lines drained from now on
    pub fn set_target_pid(&mut self, pid: Option<i32>) {
        self.target_pid = pid;
    }

    /// Lowest priority to keep; applies to lines drained from now on
    pub fn set_min_priority(&mut self, priority: Priority) {
        self.min_priority = priority;
    }

    /// Swap device capabilities, which also selects the line grammar
    pub fn set_capabilities(&mut self, capabilities: DeviceCapabilities) {
        if self.is_attached() && capabilities.log_format() != self.parser.format() {
            warn!(
                format = capabilities.log_format().as_arg(),
                "Line format changed while a producer is attached"
            );
        }
        self.capabilities = capabilities;
        self.parser = LineParser::for_capabilities(&capabilities);
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    pub fn filter_is_valid(&self) -> bool {
        self.engine.filter().is_valid()
    }

    // ========================================================================
    // Buffers and selection
    // ========================================================================

    /// Empty both buffers; not allowed while a producer is attached
    pub fn clear(&mut self) -> Result<()> {
        if self.is_attached() {
            return Err(SessionError::ProducerAttached);
        }

        let stale = self.sink.take().len();
        if stale > 0 {
            debug!(lines = stale, "Discarding undrained lines");
        }
        self.raw.clear();
        self.filtered.clear();
        self.emit(SessionEvent::Cleared);
        Ok(())
    }

    pub fn raw(&self) -> &EntryBuffer {
        &self.raw
    }

    pub fn filtered(&self) -> &EntryBuffer {
        &self.filtered
    }

    pub fn priority_counts(&self) -> PriorityCounts {
        self.raw.priority_counts()
    }

    /// Select every entry currently shown
    pub fn select_all(&self) {
        for entry in self.filtered.iter() {
            entry.set_selected(true);
        }
    }

    /// Deselect everything, including entries hidden by the filter
    pub fn clear_selection(&self) {
        for entry in self.raw.iter() {
            entry.set_selected(false);
        }
    }

    /// Selected entries among the filtered ones, oldest first
    pub fn selected_entries(&self) -> Vec<ArcLogEntry> {
        self.filtered
            .iter()
            .filter(|e| e.is_selected())
            .cloned()
            .collect()
    }

    /// Selected entries as text, one line each
    pub fn copy_selected(&self) -> String {
        self.selected_entries()
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Drop for LogSession {
    fn drop(&mut self) {
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }
    }
}
