//! Main-thread task dispatcher for droidlog
//!
//! Work runs on background worker threads (or inline when requested) and its
//! result is handed back to the thread that owns the dispatcher on the next
//! `drain` call.

mod dispatcher;
mod error;

pub use dispatcher::{Dispatcher, DispatcherConfig, TaskId};
pub use error::{DispatchError, Result, TaskOutcome, WorkFailure};
