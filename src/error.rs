use std::{fmt, io};
use thiserror::Error;

use crate::transport::Status;

/// Errors surfaced by the listener, the accept path and the pump.
#[derive(Debug, Error)]
pub enum Error {
    /// A kernel call failed with a status the accept path cannot recover from
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The listener has been disposed and can no longer be used
    #[error("listener has been disposed")]
    Closed,

    /// The listener is not started
    #[error("listener is not listening")]
    NotListening,

    /// The pump was asked to start twice
    #[error("pump already started")]
    AlreadyStarted,

    /// A completion source was driven out of protocol
    #[error("completion source misuse: {0}")]
    Completion(#[from] CompletionError),

    /// The kernel handed over a request head that does not parse
    #[error("invalid request head: {0}")]
    InvalidRequest(#[from] httparse::Error),

    /// The request head ended before the blank line
    #[error("request head is incomplete")]
    IncompleteRequest,

    /// The parsed head could not be turned into request parts
    #[error("invalid request parts: {0}")]
    Http(#[from] hyper::http::Error),

    /// The request was already answered, aborted or released
    #[error("request {0} has already completed")]
    RequestCompleted(u64),

    /// Starting the pump requires a tokio runtime
    #[error("no tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Port(#[from] PortError),
}

impl Error {
    /// Whether this error means the listener went away underneath the caller.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed | Error::NotListening)
    }

    /// Kernel status carried by a transport error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Transport(err) => Some(err.status),
            _ => None,
        }
    }
}

/// A kernel call returned a failure status.
#[derive(Debug, Error)]
pub struct TransportError {
    /// The kernel call that failed
    pub operation: &'static str,
    /// Raw kernel status code
    pub status: Status,
    /// Optional extra context, e.g. the prefix that collided
    pub detail: Option<String>,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with status {}", self.operation, self.status)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl TransportError {
    pub fn new(operation: &'static str, status: Status) -> Self {
        Self { operation, status, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Usage errors of a [`CompletionSource`](crate::completion::CompletionSource).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompletionError {
    /// Resolve, reject or await without a prior reset
    #[error("completion source was not reset")]
    NotReset,

    /// A second resolve or reject for the same operation
    #[error("completion source already completed")]
    AlreadyCompleted,

    /// The result of this operation was already taken
    #[error("completion result already consumed")]
    AlreadyConsumed,

    /// Awaiting with the token of an earlier operation
    #[error("completion token belongs to an earlier operation")]
    StaleToken,
}

/// Represents errors that can occur in the dispatch thread pool.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Represents errors raised by the completion port thread.
#[derive(Debug, Error)]
pub enum PortError {
    /// Error during port initialization
    #[error("completion port initialization failed: {0}")]
    Init(io::Error),

    /// Error waking the port thread after posting a packet
    #[error("completion port wake failed: {0}")]
    Wake(io::Error),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(io::Error),

    /// The port was shut down before the packet could be posted
    #[error("completion port is closed")]
    Closed,

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,
}

/// Type alias for Results using the crate-wide [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Type alias for Results using ExecutorError as the error type
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// Type alias for Results using PortError as the error type
pub type PortResult<T> = std::result::Result<T, PortError>;
