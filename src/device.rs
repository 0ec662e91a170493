//! adb command lines

use std::process::Command;

use thiserror::Error;
use tracing::debug;

use droidlog_logs::{DeviceCapabilities, Priority};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to run adb: {0}")]
    Io(#[from] std::io::Error),

    #[error("adb exited with {status}: {stderr}")]
    Adb { status: String, stderr: String },

    #[error("unexpected API level '{0}'")]
    InvalidApiLevel(String),
}

fn serial_args(serial: Option<&str>) -> Vec<String> {
    match serial {
        Some(serial) => vec!["-s".to_string(), serial.to_string()],
        None => Vec::new(),
    }
}

/// Ask the device for its API level; blocks until adb answers
pub fn probe_api_level(adb: &str, serial: Option<&str>) -> Result<u32, DeviceError> {
    let output = Command::new(adb)
        .args(serial_args(serial))
        .args(["shell", "getprop", "ro.build.version.sdk"])
        .output()?;

    if !output.status.success() {
        return Err(DeviceError::Adb {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!(output = %stdout.trim(), "Device API level probed");
    parse_api_level(&stdout)
}

fn parse_api_level(output: &str) -> Result<u32, DeviceError> {
    let value = output.trim();
    value
        .parse()
        .map_err(|_| DeviceError::InvalidApiLevel(value.to_string()))
}

/// Arguments for `adb logcat`, pushing down whatever the device can filter itself
pub fn logcat_args(
    serial: Option<&str>,
    capabilities: &DeviceCapabilities,
    tags: &[String],
    pid: Option<i32>,
    min_priority: Priority,
) -> Vec<String> {
    let mut args = serial_args(serial);
    args.push("logcat".to_string());
    args.push("-v".to_string());
    args.push(capabilities.log_format().as_arg().to_string());

    if let Some(pid) = pid.filter(|_| capabilities.supports_pid_filter) {
        args.push(format!("--pid={pid}"));
    }

    let level = min_priority.as_char();
    if capabilities.supports_tag_filter && !tags.is_empty() {
        args.extend(tags.iter().map(|tag| format!("{tag}:{level}")));
        args.push("*:S".to_string());
    } else {
        args.push(format!("*:{level}"));
    }
    args
}
