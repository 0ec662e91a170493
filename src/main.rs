use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use droidlog_dispatch::{Dispatcher, TaskOutcome};
use droidlog_logs::{
    ArcLogEntry, CommandProducer, DeviceCapabilities, LogSession, Priority, SessionEvent,
};

mod config;
mod device;

use config::Config;

/// droidlog - live Android logcat with incremental filtering
#[derive(Parser, Debug)]
#[command(name = "droidlog")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device serial (passed to adb -s)
    #[arg(short, long)]
    serial: Option<String>,

    /// Path to the adb executable
    #[arg(long, value_name = "PATH")]
    adb: Option<String>,

    /// Device API level (skips asking the device)
    #[arg(long)]
    api_level: Option<u32>,

    /// Only show messages containing this text
    #[arg(short, long)]
    filter: Option<String>,

    /// Treat the filter as a regular expression
    #[arg(long)]
    regex: bool,

    /// Match the filter case-sensitively
    #[arg(long)]
    match_case: bool,

    /// Only keep entries with this tag (repeatable)
    #[arg(short, long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// Only keep entries from this process
    #[arg(long)]
    pid: Option<i32>,

    /// Lowest priority to keep (V, D, I, W, E, F)
    #[arg(long, value_name = "P")]
    min_priority: Option<Priority>,

    /// Print entries as JSON lines
    #[arg(long)]
    json: bool,

    /// Exit when the log source goes away
    #[arg(long)]
    exit_on_disconnect: bool,

    /// Read lines from this command instead of adb logcat
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

/// Internal actions for async operations
enum InternalAction {
    /// API level is known, start reading logcat
    DeviceReady(u32),
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(serial) = &args.serial {
        config.device.serial = Some(serial.clone());
    }
    if let Some(adb) = &args.adb {
        config.device.adb = adb.clone();
    }
    if args.api_level.is_some() {
        config.device.api_level = args.api_level;
    }
    if let Some(filter) = &args.filter {
        config.filter.pattern = filter.clone();
    }
    config.filter.regex |= args.regex;
    config.filter.match_case |= args.match_case;
    if !args.tags.is_empty() {
        config.filter.tags = args.tags.clone();
    }
    if args.pid.is_some() {
        config.filter.pid = args.pid;
    }
    if let Some(priority) = args.min_priority {
        config.filter.min_priority = priority;
    }

    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<InternalAction>();

    let dispatcher = Dispatcher::new(config.dispatcher_config())?;
    let mut session = LogSession::new(config.session_config())?;
    let mut events = session.subscribe();

    if !session.filter_is_valid() {
        warn!(pattern = %config.filter.pattern, "Invalid filter regex, showing everything");
    }

    if let Some((program, command_args)) = args.command.split_first() {
        let producer = CommandProducer::new(program.clone(), command_args.iter().cloned());
        session
            .attach(Box::new(producer))
            .with_context(|| format!("Failed to start '{program}'"))?;
    } else if let Some(level) = config.device.api_level {
        start_logcat(&mut session, &config, level)?;
    } else {
        let tx = internal_tx.clone();
        dispatcher.schedule(
            (config.device.adb.clone(), config.device.serial.clone()),
            |(adb, serial)| device::probe_api_level(&adb, serial.as_deref()),
            move |outcome: TaskOutcome<_>| {
                let level = match outcome {
                    Ok(Ok(level)) => level,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Could not read device API level, assuming a legacy device");
                        0
                    }
                    Err(failure) => {
                        warn!(error = %failure, "Device probe failed, assuming a legacy device");
                        0
                    }
                };
                if tx.send(InternalAction::DeviceReady(level)).is_err() {
                    debug!(api_level = level, "Main loop gone, dropping device probe result");
                }
            },
            false,
        )?;
    }

    let mut printer = Printer::new(args.json);
    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.session.tick_interval_ms.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                dispatcher.drain()?;
                let report = session.drain();
                if report.lines > 0 {
                    debug!(?report, "Drained log lines");
                }
            }

            Some(event) = events.recv() => {
                match event {
                    SessionEvent::FilteredEntriesAdded(entries) => printer.print(&entries)?,
                    SessionEvent::FilteredEntriesReplaced(outcome) => {
                        debug!(?outcome, "Filtered entries replaced");
                    }
                    SessionEvent::ProducerConnected(name) => info!(producer = %name, "Reading logs"),
                    SessionEvent::ProducerDisconnected(name) => {
                        info!(producer = %name, "Log source disconnected");
                        if args.exit_on_disconnect {
                            break;
                        }
                    }
                    SessionEvent::RawEntriesAdded { .. } | SessionEvent::Cleared => {}
                }
            }

            Some(internal) = internal_rx.recv() => {
                match internal {
                    InternalAction::DeviceReady(level) => start_logcat(&mut session, &config, level)?,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.detach();
    dispatcher.shutdown()?;
    Ok(())
}

/// Switch the session to the device's capabilities and attach `adb logcat`
fn start_logcat(session: &mut LogSession, config: &Config, level: u32) -> Result<()> {
    let capabilities = DeviceCapabilities::for_api_level(level);
    info!(api_level = level, format = capabilities.log_format().as_arg(), "Device ready");
    session.set_capabilities(capabilities);

    let logcat_args = device::logcat_args(
        config.device.serial.as_deref(),
        &capabilities,
        &config.filter.tags,
        config.filter.pid,
        config.filter.min_priority,
    );
    let producer = CommandProducer::new(config.device.adb.clone(), logcat_args);
    session
        .attach(Box::new(producer))
        .context("Failed to start adb logcat")
}

/// Writes filtered entries to stdout
struct Printer {
    json: bool,
}

impl Printer {
    fn new(json: bool) -> Self {
        Self { json }
    }

    fn print(&mut self, entries: &[ArcLogEntry]) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for entry in entries {
            if self.json {
                serde_json::to_writer(&mut out, entry.as_ref())?;
                writeln!(out)?;
            } else {
                writeln!(out, "{entry}")?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_api_level_starts_logcat_immediately() {
        let mut config = Config::default();
        config.device.adb = "/nonexistent/adb".to_string();
        let mut session = LogSession::new(config.session_config()).unwrap();

        let result = start_logcat(&mut session, &config, 30);
        assert!(result.is_err());
        assert!(session.capabilities().supports_year_format);
        assert!(!session.is_attached());
    }
}
