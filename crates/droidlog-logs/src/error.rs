use thiserror::Error;

/// A line that could not be turned into an entry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line does not match the {format} grammar")]
    NoMatch { format: &'static str },

    #[error("unknown priority character '{0}'")]
    InvalidPriority(char),

    #[error("{field} '{value}' is out of range")]
    InvalidNumber { field: &'static str, value: String },
}

/// Failures starting a line producer
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("producer is already running")]
    AlreadyStarted,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Misuse of a log session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("operation not allowed while a producer is attached")]
    ProducerAttached,

    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Producer(#[from] ProducerError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
