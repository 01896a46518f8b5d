#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! ## Architecture
//! The engine is built from a few layered pieces:
//!
//! - `KernelTransport`: The kernel HTTP API surface the engine drives
//! - `Listener`: Owns the session, url group and request queue, and turns
//!   failed requests into error responses
//! - `AcceptContext`: A reusable receive operation that yields one
//!   `RequestContext` per accept
//! - `Pump`: Runs accept loops and dispatches requests to an `Application`
//!   on the dispatch thread pool
//! - `LoopbackTransport`: An in-process kernel that delivers completions
//!   through a `CompletionPort`
//!
//! ## Configuration
//! Settings can be configured via:
//! - Environment variables (prefixed with `KACCEPT_`)
//! - Configuration file (`kaccept.toml`)
//! - `ListenerOptions` and `PumpSettings` directly

pub use crate::accept::{
    default_policy, AcceptContext, LogViolation, Overlapped, PanicOnViolation, ProtocolViolation,
    ViolationPolicy,
};
pub use crate::buffer::{BufferPool, NativeRequestBuffer, NativeRequestHeader};
pub use crate::completion::{CompletionSource, Token, Wait};
pub use crate::config::{ServerConfig, TimeoutSettings};
pub use crate::error::{
    CompletionError, Error, ExecutorError, PortError, Result, TransportError,
};
pub use crate::executor::Executor;
pub use crate::listener::{Listener, ListenerOptions, State as ListenerState};
pub use crate::loopback::{LoopbackRequest, LoopbackTransport, SentResponse, SubmitError};
pub use crate::port::CompletionPort;
pub use crate::pump::{Application, BoxError, Pump, PumpSettings, ShutdownOutcome};
pub use crate::request::RequestContext;

pub use hyper;

mod accept;
mod buffer;
mod completion;
mod config;
mod error;
mod executor;
mod listener;
mod loopback;
mod port;
mod pump;
mod request;
pub mod transport;

#[cfg(test)]
mod testing;
