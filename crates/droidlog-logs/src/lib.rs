//! Log processing for droidlog
//!
//! This crate provides entry buffering, logcat line parsing, incremental
//! filtering, and the producers that feed a [`LogSession`].

mod buffer;
mod error;
mod filter;
mod parser;
mod producer;
mod session;

pub use buffer::{EntryBuffer, PriorityCounts};
pub use error::{ParseError, ProducerError, Result, SessionError};
pub use filter::{CompiledFilter, FilterCriteria, FilterEngine, RefilterOutcome};
pub use parser::{LineParser, THREADTIME_YEAR};
pub use producer::{CommandProducer, LineProducer};
pub use session::{
    DEFAULT_MAX_CACHED_ENTRIES, DEFAULT_MAX_DISPLAYED_ENTRIES, DrainReport, LineSink, LogSession,
    SessionConfig, SessionEvent,
};

// Re-export types used in our public API
pub use droidlog_types::{ArcLogEntry, DeviceCapabilities, LogEntry, LogFormat, Priority};
