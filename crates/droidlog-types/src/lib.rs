//! Shared types for droidlog
//!
//! This crate contains data structures used across multiple droidlog crates.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

// ============================================================================
// Device Types
// ============================================================================

/// Timestamp layout requested from `adb logcat -v <format>`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LogFormat {
    /// `MM-dd HH:mm:ss.fff`, available on every device
    #[default]
    ThreadTime,
    /// `yyyy-MM-dd HH:mm:ss.fff`, Android 7.0 and newer
    Year,
}

impl LogFormat {
    /// Value passed to `logcat -v`
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::ThreadTime => "threadtime",
            Self::Year => "year",
        }
    }
}

/// What the connected device can do on its own, read-only to the core
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    /// `logcat -v year` is available
    pub supports_year_format: bool,

    /// `logcat --pid=<pid>` is available
    pub supports_pid_filter: bool,

    /// Tag/regex filtering can be pushed down to the device
    pub supports_tag_filter: bool,
}

impl DeviceCapabilities {
    /// First API level (Android 7.0) with `-v year`, `--pid` and `--regex`
    pub const MODERN_API_LEVEL: u32 = 24;

    /// Capabilities of a device running the given API level
    pub fn for_api_level(api_level: u32) -> Self {
        let modern = api_level >= Self::MODERN_API_LEVEL;
        Self {
            supports_year_format: modern,
            supports_pid_filter: modern,
            supports_tag_filter: modern,
        }
    }

    /// Line format the device should be asked to print
    pub fn log_format(&self) -> LogFormat {
        if self.supports_year_format {
            LogFormat::Year
        } else {
            LogFormat::ThreadTime
        }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Log priority as printed by logcat
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Priority {
    Verbose,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl Priority {
    /// All priorities, lowest first
    pub const ALL: [Priority; 6] = [
        Self::Verbose,
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Fatal,
    ];

    /// Map the single priority character of a logcat line
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'V' => Some(Self::Verbose),
            'D' => Some(Self::Debug),
            'I' => Some(Self::Info),
            'W' => Some(Self::Warn),
            'E' => Some(Self::Error),
            'F' => Some(Self::Fatal),
            _ => None,
        }
    }

    /// Single character used by logcat output and filterspecs
    pub fn as_char(&self) -> char {
        match self {
            Self::Verbose => 'V',
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Warn => 'W',
            Self::Error => 'E',
            Self::Fatal => 'F',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verbose => "Verbose",
            Self::Debug => "Debug",
            Self::Info => "Info",
            Self::Warn => "Warn",
            Self::Error => "Error",
            Self::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a priority name cannot be recognised
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("unknown priority '{0}'")]
pub struct UnknownPriority(pub String);

impl FromStr for Priority {
    type Err = UnknownPriority;

    /// Accepts the logcat letter or the full name, in any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v" | "verbose" => Ok(Self::Verbose),
            "d" | "debug" => Ok(Self::Debug),
            "i" | "info" => Ok(Self::Info),
            "w" | "warn" | "warning" => Ok(Self::Warn),
            "e" | "error" => Ok(Self::Error),
            "f" | "fatal" | "assert" => Ok(Self::Fatal),
            _ => Err(UnknownPriority(s.to_string())),
        }
    }
}

/// Timestamp layout used when an entry is printed back as a line
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A single parsed log record
///
/// Everything but the selection flag is fixed once the entry is shared.
#[derive(Debug, Serialize)]
pub struct LogEntry {
    /// Sequence number assigned when the entry enters a session's raw buffer
    pub id: u64,

    /// Device timestamp (epoch when unknown)
    pub timestamp: NaiveDateTime,

    /// Process id, -1 for unparsable lines
    pub pid: i32,

    /// Thread id, -1 for unparsable lines
    pub tid: i32,

    pub priority: Priority,

    /// Tag (may be empty)
    pub tag: String,

    /// Message with trailing line terminators removed
    pub message: String,

    #[serde(skip)]
    selected: AtomicBool,
}

/// Entries are shared between the raw and filtered views
pub type ArcLogEntry = Arc<LogEntry>;

impl LogEntry {
    pub fn new(
        timestamp: NaiveDateTime,
        pid: i32,
        tid: i32,
        priority: Priority,
        tag: impl Into<String>,
        message: &str,
    ) -> Self {
        Self {
            id: 0,
            timestamp,
            pid,
            tid,
            priority,
            tag: tag.into(),
            message: trim_line_end(message).to_string(),
            selected: AtomicBool::new(false),
        }
    }

    /// Placeholder for a line that matched no grammar
    pub fn unparsed(raw: &str) -> Self {
        Self::new(NaiveDateTime::default(), -1, -1, Priority::Info, "", raw)
    }

    /// Whether this entry is a placeholder for an unparsable line
    pub fn is_unparsed(&self) -> bool {
        self.pid == -1 && self.tid == -1 && self.tag.is_empty()
    }

    pub fn is_selected(&self) -> bool {
        self.selected.load(Ordering::Relaxed)
    }

    pub fn set_selected(&self, selected: bool) {
        self.selected.store(selected, Ordering::Relaxed);
    }
}

impl fmt::Display for LogEntry {
    /// Prints the entry in the `-v year` layout
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}: {}",
            self.timestamp.format(TIME_FORMAT),
            self.pid,
            self.tid,
            self.priority.as_char(),
            self.tag,
            self.message
        )
    }
}

fn trim_line_end(s: &str) -> &str {
    s.trim_end_matches(['\r', '\n'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn timestamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_milli_opt(12, 30, 5, 42)
            .unwrap()
    }

    #[test]
    fn test_priority_chars() {
        for priority in Priority::ALL {
            assert_eq!(Priority::from_char(priority.as_char()), Some(priority));
        }
        assert_eq!(Priority::from_char('S'), None);
        assert_eq!(Priority::from_char('i'), None);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("w".parse::<Priority>(), Ok(Priority::Warn));
        assert_eq!("Error".parse::<Priority>(), Ok(Priority::Error));
        let err = "loud".parse::<Priority>().unwrap_err();
        assert_eq!(err.to_string(), "unknown priority 'loud'");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        assert!(boxed.source().is_none());
        assert!(Priority::Verbose < Priority::Fatal);
    }

    #[test]
    fn test_entry_strips_line_terminators() {
        let entry = LogEntry::new(timestamp(), 1, 2, Priority::Debug, "Tag", "hello\r\n");
        assert_eq!(entry.message, "hello");
    }

    #[test]
    fn test_unparsed_entry() {
        let entry = LogEntry::unparsed("--------- beginning of main\n");
        assert_eq!(entry.pid, -1);
        assert_eq!(entry.tid, -1);
        assert_eq!(entry.priority, Priority::Info);
        assert_eq!(entry.tag, "");
        assert_eq!(entry.message, "--------- beginning of main");
        assert!(entry.is_unparsed());
    }

    #[test]
    fn test_display_uses_year_layout() {
        let entry = LogEntry::new(timestamp(), 100, 200, Priority::Info, "TagX", "hello");
        assert_eq!(entry.to_string(), "2023-01-01 12:30:05.042 100 200 I TagX: hello");
    }

    #[test]
    fn test_selection_flag() {
        let entry = Arc::new(LogEntry::unparsed("x"));
        let shared = Arc::clone(&entry);
        assert!(!entry.is_selected());
        shared.set_selected(true);
        assert!(entry.is_selected());
    }

    #[test]
    fn test_serialize_skips_selection() {
        let entry = LogEntry::new(timestamp(), 1, 2, Priority::Warn, "T", "m");
        entry.set_selected(true);
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("selected").is_none());
        assert_eq!(json["priority"], "Warn");
        assert_eq!(json["tag"], "T");
    }

    #[test]
    fn test_capabilities_for_api_level() {
        let old = DeviceCapabilities::for_api_level(23);
        assert_eq!(old, DeviceCapabilities::default());
        assert_eq!(old.log_format(), LogFormat::ThreadTime);

        let modern = DeviceCapabilities::for_api_level(28);
        assert!(modern.supports_year_format);
        assert!(modern.supports_pid_filter);
        assert!(modern.supports_tag_filter);
        assert_eq!(modern.log_format().as_arg(), "year");
    }
}
