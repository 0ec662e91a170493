use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use futures::StreamExt;
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ProducerError;
use crate::session::LineSink;

/// Longest line delivered from a child process; longer lines are split
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Background source of raw log lines
///
/// A producer delivers lines through the sink from its own thread or task.
/// `stop` must be idempotent, and `has_exited` must stay answerable after the
/// producer is gone.
pub trait LineProducer: Send {
    /// Name used in connect/disconnect notifications
    fn name(&self) -> &str;

    fn start(&mut self, sink: LineSink) -> Result<(), ProducerError>;

    /// Ask the producer to finish
    fn stop(&mut self);

    /// Terminate immediately
    fn kill(&mut self);

    /// True once the producer will deliver no more lines
    fn has_exited(&self) -> bool;
}

/// Runs a command and feeds its stdout and stderr lines to a sink
pub struct CommandProducer {
    program: String,
    args: Vec<String>,
    name: String,

    /// Cancellation token for stopping the reader
    cancel: CancellationToken,

    task: Option<JoinHandle<()>>,

    exited: Arc<AtomicBool>,
}

impl CommandProducer {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let name = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            program,
            args,
            name,
            cancel: CancellationToken::new(),
            task: None,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_child(&self) -> Result<Child, ProducerError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProducerError::Spawn {
                command: self.name.clone(),
                source,
            })
    }
}

impl LineProducer for CommandProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, sink: LineSink) -> Result<(), ProducerError> {
        if self.task.is_some() {
            return Err(ProducerError::AlreadyStarted);
        }
        let handle = Handle::try_current().map_err(|e| ProducerError::NoRuntime(e.to_string()))?;

        // Spawning registers the child with the runtime's process driver
        let _guard = handle.enter();
        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to start log producer");
                self.exited.store(true, Ordering::Release);
                return Err(e);
            }
        };
        info!(command = %self.name, pid = ?child.id(), "Log producer started");

        let stdout = child
            .stdout
            .take()
            .map(|out| FramedRead::new(out, LossyLineCodec::new(MAX_LINE_LENGTH)));
        let stderr = child
            .stderr
            .take()
            .map(|err| FramedRead::new(err, LossyLineCodec::new(MAX_LINE_LENGTH)));
        let cancel = self.cancel.clone();
        let exited = Arc::clone(&self.exited);
        let name = self.name.clone();

        let task = handle.spawn(async move {
            let mut lines = match (stdout, stderr) {
                (Some(out), Some(err)) => futures::stream::select(out, err).boxed(),
                (Some(out), None) => out.boxed(),
                (None, Some(err)) => err.boxed(),
                (None, None) => futures::stream::empty::<std::io::Result<String>>().boxed(),
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            debug!(error = %e, "Producer child already gone");
                        }
                        break;
                    }

                    line = lines.next() => {
                        match line {
                            Some(Ok(line)) => sink.on_data_received(Some(&line)),
                            // Only a failing pipe ends a stream, decoding never does
                            Some(Err(e)) => {
                                warn!(command = %name, error = %e, "Failed to read producer output");
                            }
                            // Both pipes closed
                            None => break,
                        }
                    }
                }
            }

            match child.wait().await {
                Ok(status) => info!(command = %name, %status, "Log producer exited"),
                Err(e) => warn!(command = %name, error = %e, "Failed to reap log producer"),
            }
            exited.store(true, Ordering::Release);
        });

        self.task = Some(task);
        Ok(())
    }

    fn stop(&mut self) {
        self.cancel.cancel();
    }

    fn kill(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            // Dropping the aborted future drops the child, which kills it
            task.abort();
        }
        self.exited.store(true, Ordering::Release);
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

impl Drop for CommandProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Splits output on `\n` without ever failing on the content
///
/// Invalid UTF-8 is replaced with U+FFFD, a trailing `\r` is dropped, and a
/// line longer than `max_length` bytes is delivered in `max_length` pieces.
#[derive(Debug)]
struct LossyLineCodec {
    max_length: usize,

    /// Bytes already searched for a newline
    next_index: usize,
}

impl LossyLineCodec {
    fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
        }
    }
}

impl Decoder for LossyLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        let window = buf.len().min(self.max_length + 1);
        let newline = buf[self.next_index.min(window)..window]
            .iter()
            .position(|b| *b == b'\n')
            .map(|pos| self.next_index.min(window) + pos);

        if let Some(end) = newline {
            self.next_index = 0;
            let line = buf.split_to(end + 1);
            return Ok(Some(decode_line(&line[..end])));
        }

        if buf.len() > self.max_length {
            self.next_index = 0;
            let piece = buf.split_to(self.max_length);
            return Ok(Some(decode_line(&piece)));
        }

        self.next_index = buf.len();
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        Ok(Some(decode_line(&rest)))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
