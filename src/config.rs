//! Config file support
//!
//! Every section and key is optional; missing values fall back to defaults and
//! command-line flags override whatever the file says.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use droidlog_dispatch::DispatcherConfig;
use droidlog_logs::{
    DEFAULT_MAX_CACHED_ENTRIES, DEFAULT_MAX_DISPLAYED_ENTRIES, DeviceCapabilities, FilterCriteria,
    Priority, SessionConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionSection,
    pub dispatcher: DispatcherSection,
    pub device: DeviceSection,
    pub filter: FilterSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Raw entries kept in memory (0 = unbounded)
    pub max_cached_entries: usize,

    /// Filtered entries kept in memory (0 = unbounded); when unset, the
    /// default capped to `max_cached_entries`
    pub max_displayed_entries: Option<usize>,

    /// How often queued lines and finished tasks are drained
    pub tick_interval_ms: u64,
}

impl SessionSection {
    pub fn max_displayed_entries(&self) -> usize {
        match (self.max_displayed_entries, self.max_cached_entries) {
            (Some(displayed), _) => displayed,
            (None, 0) => DEFAULT_MAX_DISPLAYED_ENTRIES,
            (None, cached) => DEFAULT_MAX_DISPLAYED_ENTRIES.min(cached),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_cached_entries: DEFAULT_MAX_CACHED_ENTRIES,
            max_displayed_entries: None,
            tick_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub worker_threads: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            worker_threads: DispatcherConfig::default().worker_threads,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// adb executable
    pub adb: String,

    /// Device serial, for when more than one device is connected
    pub serial: Option<String>,

    /// Known API level; skips asking the device
    pub api_level: Option<u32>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            adb: "adb".to_string(),
            serial: None,
            api_level: None,
        }
    }
}

impl DeviceSection {
    /// Capabilities implied by the configured API level, legacy when unknown
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.api_level
            .map(DeviceCapabilities::for_api_level)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterSection {
    pub pattern: String,
    pub regex: bool,
    pub match_case: bool,
    pub tags: Vec<String>,
    pub pid: Option<i32>,

    /// Letter or name, e.g. "W" or "warn"
    #[serde(deserialize_with = "deserialize_priority")]
    pub min_priority: Priority,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            regex: false,
            match_case: false,
            tags: Vec::new(),
            pid: None,
            min_priority: Priority::Verbose,
        }
    }
}

impl FilterSection {
    pub fn criteria(&self) -> FilterCriteria {
        FilterCriteria::new(self.pattern.clone())
            .with_regex(self.regex)
            .with_match_case(self.match_case)
    }
}

fn deserialize_priority<'de, D>(deserializer: D) -> Result<Priority, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    value.parse().map_err(serde::de::Error::custom)
}

impl Config {
    /// Load the config from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_cached_entries: self.session.max_cached_entries,
            max_displayed_entries: self.session.max_displayed_entries(),
            capabilities: self.device.capabilities(),
            filter: self.filter.criteria(),
            tags: self.filter.tags.iter().cloned().collect::<HashSet<_>>(),
            target_pid: self.filter.pid,
            min_priority: self.filter.min_priority,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_threads: self.dispatcher.worker_threads,
        }
    }
}
