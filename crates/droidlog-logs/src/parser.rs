use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::{Captures, Regex};
use tracing::warn;

use droidlog_types::{DeviceCapabilities, LogEntry, LogFormat, Priority};

use crate::error::ParseError;

/// Year assumed for `threadtime` timestamps, which carry no year
///
/// A leap year, so that February 29th lines still parse.
pub const THREADTIME_YEAR: i32 = 2000;

const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Everything after the timestamp is shared by both grammars. The tag is
/// matched lazily so the first `:` followed by whitespace ends it; a colon
/// inside the tag (`a:b`) or a `: ` inside the message both survive.
macro_rules! logcat_line {
    ($date:literal) => {
        concat!(
            r"^\s*(?P<date>",
            $date,
            r")\s+(?P<time>\d{2}:\d{2}:\d{2}\.\d{3})\s+(?P<pid>\d+)\s+(?P<tid>\d+)\s+(?P<priority>\S)\s+(?P<tag>.*?)\s*:(?:\s(?P<msg>.*))?$"
        )
    };
}

/// Lines printed by `adb logcat -v year`
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(logcat_line!(r"\d{4}-\d{2}-\d{2}")).expect("year grammar compiles")
});

/// Lines printed by `adb logcat -v threadtime`
static THREADTIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(logcat_line!(r"\d{2}-\d{2}")).expect("threadtime grammar compiles")
});

/// Turns raw logcat lines into entries for one line format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineParser {
    format: LogFormat,
}

impl LineParser {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }

    /// Parser for the format the device prints
    pub fn for_capabilities(capabilities: &DeviceCapabilities) -> Self {
        Self::new(capabilities.log_format())
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    fn grammar(&self) -> &'static Regex {
        match self.format {
            LogFormat::Year => &YEAR_RE,
            LogFormat::ThreadTime => &THREADTIME_RE,
        }
    }

    /// Parse a raw line into an entry
    ///
    /// The returned entry has id 0; the session numbers entries when they
    /// enter its raw buffer.
    pub fn parse(&self, line: &str) -> Result<LogEntry, ParseError> {
        let line = strip_line_end(line);
        let caps = self.grammar().captures(line).ok_or(ParseError::NoMatch {
            format: self.format.as_arg(),
        })?;

        let priority_char = caps["priority"].chars().next().unwrap_or(' ');
        let priority =
            Priority::from_char(priority_char).ok_or(ParseError::InvalidPriority(priority_char))?;

        let pid = parse_id(&caps, "pid")?;
        let tid = parse_id(&caps, "tid")?;
        let timestamp = self.parse_timestamp(&caps["date"], &caps["time"]);
        let message = caps.name("msg").map_or("", |m| m.as_str());

        Ok(LogEntry::new(timestamp, pid, tid, priority, &caps["tag"], message))
    }

    /// Parse the timestamp, falling back to the epoch if the date is impossible
    fn parse_timestamp(&self, date: &str, time: &str) -> NaiveDateTime {
        let text = match self.format {
            LogFormat::Year => format!("{date} {time}"),
            LogFormat::ThreadTime => format!("{THREADTIME_YEAR}-{date} {time}"),
        };

        NaiveDateTime::parse_from_str(&text, DATE_TIME_FORMAT).unwrap_or_else(|e| {
            warn!(timestamp = %text, error = %e, "Unparsable log timestamp");
            NaiveDateTime::default()
        })
    }
}

fn parse_id(caps: &Captures<'_>, field: &'static str) -> Result<i32, ParseError> {
    let value = &caps[field];
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn strip_line_end(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn year() -> LineParser {
        LineParser::new(LogFormat::Year)
    }

    fn threadtime() -> LineParser {
        LineParser::new(LogFormat::ThreadTime)
    }

    #[test]
    fn test_parse_year_line() {
        let entry = year()
            .parse("2023-01-01 00:00:00.000 100 200 I TagX: hello")
            .unwrap();

        assert_eq!(entry.pid, 100);
        assert_eq!(entry.tid, 200);
        assert_eq!(entry.priority, Priority::Info);
        assert_eq!(entry.tag, "TagX");
        assert_eq!(entry.message, "hello");
        assert_eq!(entry.timestamp.year(), 2023);
    }

    #[test]
    fn test_display_round_trip() {
        let line = "2023-01-01 00:00:00.000 100 200 I TagX: hello";
        let entry = year().parse(line).unwrap();
        assert_eq!(entry.to_string(), line);

        let reparsed = year().parse(&entry.to_string()).unwrap();
        assert_eq!(reparsed.timestamp, entry.timestamp);
        assert_eq!(reparsed.pid, entry.pid);
        assert_eq!(reparsed.tid, entry.tid);
        assert_eq!(reparsed.priority, entry.priority);
        assert_eq!(reparsed.tag, entry.tag);
        assert_eq!(reparsed.message, entry.message);
    }

    #[test]
    fn test_parse_threadtime_line() {
        let entry = threadtime()
            .parse("10-25 14:27:56.862  2255  2256 E chromium: Help")
            .unwrap();

        assert_eq!(entry.pid, 2255);
        assert_eq!(entry.tid, 2256);
        assert_eq!(entry.priority, Priority::Error);
        assert_eq!(entry.tag, "chromium");
        assert_eq!(entry.message, "Help");
        assert_eq!(entry.timestamp.year(), THREADTIME_YEAR);
        assert_eq!(entry.timestamp.month(), 10);
        assert_eq!(entry.timestamp.nanosecond(), 862_000_000);
    }

    #[test]
    fn test_threadtime_leap_day() {
        let entry = threadtime()
            .parse("02-29 00:00:00.000 1 1 D Leap: day")
            .unwrap();
        assert_eq!(entry.timestamp.day(), 29);
    }

    #[test]
    fn test_grammars_are_exclusive() {
        assert!(year().parse("10-25 14:27:56.862 1 2 I Tag: msg").is_err());
        assert!(threadtime().parse("2023-10-25 14:27:56.862 1 2 I Tag: msg").is_err());
    }

    #[test]
    fn test_tag_with_colon_and_message_with_separator() {
        let entry = year()
            .parse("2023-01-01 00:00:00.000 1 2 W a:b: key: value")
            .unwrap();
        assert_eq!(entry.tag, "a:b");
        assert_eq!(entry.message, "key: value");
    }

    #[test]
    fn test_tag_with_spaces_and_padding() {
        let entry = threadtime()
            .parse("08-24 14:22:33.123  1234  5678 I My Tag   : hello world")
            .unwrap();
        assert_eq!(entry.tag, "My Tag");
        assert_eq!(entry.message, "hello world");
    }

    #[test]
    fn test_empty_tag_and_message() {
        let entry = year().parse("2023-01-01 00:00:00.000 1 2 D : ").unwrap();
        assert_eq!(entry.tag, "");
        assert_eq!(entry.message, "");

        let entry = year().parse("2023-01-01 00:00:00.000 1 2 D Tag:").unwrap();
        assert_eq!(entry.tag, "Tag");
        assert_eq!(entry.message, "");
    }

    #[test]
    fn test_strips_line_terminators() {
        let entry = year()
            .parse("2023-01-01 00:00:00.000 1 2 I Tag: trailing\r\n")
            .unwrap();
        assert_eq!(entry.message, "trailing");
    }

    #[test]
    fn test_invalid_priority_is_an_error() {
        let err = year()
            .parse("2023-01-01 00:00:00.000 1 2 S Tag: silent")
            .unwrap_err();
        assert_eq!(err, ParseError::InvalidPriority('S'));
    }

    #[test]
    fn test_unmatched_line() {
        let err = year().parse("--------- beginning of main").unwrap_err();
        assert_eq!(err, ParseError::NoMatch { format: "year" });
        assert!(year().parse("").is_err());
        assert_eq!(
            threadtime().parse("random text").unwrap_err(),
            ParseError::NoMatch {
                format: "threadtime"
            }
        );
    }

    #[test]
    fn test_pid_overflow() {
        let err = year()
            .parse("2023-01-01 00:00:00.000 99999999999 2 I Tag: big")
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidNumber { field: "pid", .. }));
    }

    #[test]
    fn test_impossible_date_falls_back_to_epoch() {
        let entry = year()
            .parse("2023-13-45 00:00:00.000 1 2 I Tag: bad date")
            .unwrap();
        assert_eq!(entry.timestamp, NaiveDateTime::default());
        assert_eq!(entry.message, "bad date");
    }

    #[test]
    fn test_for_capabilities() {
        let parser = LineParser::for_capabilities(&DeviceCapabilities::for_api_level(30));
        assert_eq!(parser.format(), LogFormat::Year);
        let parser = LineParser::for_capabilities(&DeviceCapabilities::for_api_level(19));
        assert_eq!(parser.format(), LogFormat::ThreadTime);
    }
}
