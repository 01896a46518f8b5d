//! The kernel transport boundary.
//!
//! Everything the engine asks of the kernel-mode HTTP driver goes through
//! [`KernelTransport`]. The driver owns TCP accept and header parsing; this
//! side only creates the kernel objects (server session, url group, request
//! queue), pulls parsed requests out of the queue and writes responses back.
//!
//! Calls report a raw [`Status`] the same way the driver does. Receives that
//! cannot finish immediately return [`Status::IO_PENDING`] and finish later
//! through [`Overlapped::complete`], usually on a thread other than the one
//! that issued them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use hyper::body::Bytes;
use hyper::http::{HeaderMap, StatusCode};
use serde::Deserialize;

use crate::accept::Overlapped;

/// Kernel-assigned request identifier. `0` means "any request".
pub type RequestId = u64;

/// Kernel-assigned connection identifier.
pub type ConnectionId = u64;

/// A kernel status code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const INVALID_HANDLE: Status = Status(6);
    pub const HANDLE_EOF: Status = Status(38);
    pub const NOT_SUPPORTED: Status = Status(50);
    pub const INVALID_PARAMETER: Status = Status(87);
    pub const ALREADY_EXISTS: Status = Status(183);
    /// The buffer was too small; the needed size is reported alongside.
    pub const MORE_DATA: Status = Status(234);
    pub const OPERATION_ABORTED: Status = Status(995);
    pub const IO_PENDING: Status = Status(997);
    pub const NOT_FOUND: Status = Status(1168);
    /// The request id no longer names a live request.
    pub const CONNECTION_INVALID: Status = Status(1229);

    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Status::SUCCESS => "ERROR_SUCCESS",
            Status::INVALID_HANDLE => "ERROR_INVALID_HANDLE",
            Status::HANDLE_EOF => "ERROR_HANDLE_EOF",
            Status::NOT_SUPPORTED => "ERROR_NOT_SUPPORTED",
            Status::INVALID_PARAMETER => "ERROR_INVALID_PARAMETER",
            Status::ALREADY_EXISTS => "ERROR_ALREADY_EXISTS",
            Status::MORE_DATA => "ERROR_MORE_DATA",
            Status::OPERATION_ABORTED => "ERROR_OPERATION_ABORTED",
            Status::IO_PENDING => "ERROR_IO_PENDING",
            Status::NOT_FOUND => "ERROR_NOT_FOUND",
            Status::CONNECTION_INVALID => "ERROR_CONNECTION_INVALID",
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Handle to a kernel server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Handle to a kernel url group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UrlGroupId(pub u64);

/// Handle to a kernel request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

/// Outcome of a single `receive_request` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receive {
    pub status: Status,
    /// Bytes written on success, or bytes needed on [`Status::MORE_DATA`].
    pub bytes: usize,
}

impl Receive {
    pub fn new(status: Status, bytes: usize) -> Self {
        Self { status, bytes }
    }

    pub fn pending() -> Self {
        Self::new(Status::IO_PENDING, 0)
    }
}

/// Authentication schemes the kernel can negotiate on behalf of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Basic,
    Ntlm,
    Negotiate,
    Kerberos,
}

impl AuthScheme {
    /// The `WWW-Authenticate` challenge advertised for this scheme.
    pub fn challenge(self) -> &'static str {
        match self {
            AuthScheme::Basic => "Basic realm=\"\"",
            AuthScheme::Ntlm => "NTLM",
            AuthScheme::Negotiate => "Negotiate",
            AuthScheme::Kerberos => "Kerberos",
        }
    }
}

impl FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(AuthScheme::Basic),
            "ntlm" => Ok(AuthScheme::Ntlm),
            "negotiate" => Ok(AuthScheme::Negotiate),
            "kerberos" => Ok(AuthScheme::Kerberos),
            other => Err(format!("unknown authentication scheme `{}`", other)),
        }
    }
}

/// How much detail the kernel puts in the 503 it sends when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Http503Verbosity {
    /// Reset the connection without a response.
    #[default]
    Basic,
    /// Send a 503 with a generic reason.
    Limited,
    /// Send a 503 with a detailed reason.
    Full,
}

/// Kernel-enforced timeouts applied to the url group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub entity_body: Option<Duration>,
    pub drain_entity_body: Option<Duration>,
    pub request_queue: Option<Duration>,
    pub idle_connection: Option<Duration>,
    pub header_wait: Option<Duration>,
    /// Minimum send rate in bytes per second.
    pub min_send_rate: Option<u32>,
}

impl Timeouts {
    pub fn is_empty(&self) -> bool {
        *self == Timeouts::default()
    }
}

/// Url group properties the listener sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlGroupProperty {
    /// Attach (`Some`) or detach (`None`) a request queue.
    Binding(Option<QueueHandle>),
    Authentication(Vec<AuthScheme>),
    Timeouts(Timeouts),
    MaxConnections(u64),
}

/// Request queue properties the listener sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueProperty {
    Length(u64),
    RejectionVerbosity(Http503Verbosity),
}

/// A complete response written straight to the kernel.
#[derive(Debug, Clone)]
pub struct NativeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The kernel-mode HTTP driver.
///
/// Implementations must be callable from any thread. `receive_request` may
/// finish inline (any status other than [`Status::IO_PENDING`]) or later
/// through [`Overlapped::complete`]; for a queue where
/// [`enable_skip_completion_on_success`](KernelTransport::enable_skip_completion_on_success)
/// succeeded, a receive that returns [`Status::SUCCESS`] inline produces no
/// notification, otherwise it produces one as well.
pub trait KernelTransport: Send + Sync + 'static {
    fn create_server_session(&self) -> Result<SessionId, Status>;

    fn close_server_session(&self, session: SessionId) -> Status;

    fn create_url_group(&self, session: SessionId) -> Result<UrlGroupId, Status>;

    fn close_url_group(&self, group: UrlGroupId) -> Status;

    fn set_url_group_property(&self, group: UrlGroupId, property: &UrlGroupProperty) -> Status;

    /// Register `prefix`; requests routed through it report `context`.
    fn add_url(&self, group: UrlGroupId, prefix: &str, context: u64) -> Status;

    fn remove_url(&self, group: UrlGroupId, prefix: &str) -> Status;

    fn create_request_queue(&self) -> Result<QueueHandle, Status>;

    /// Ask the kernel not to post notifications for receives that succeed
    /// inline.
    fn enable_skip_completion_on_success(&self, queue: QueueHandle) -> Status;

    fn set_request_queue_property(&self, queue: QueueHandle, property: &QueueProperty) -> Status;

    /// Close the queue. Pending receives complete with
    /// [`Status::OPERATION_ABORTED`].
    fn close_request_queue(&self, queue: QueueHandle) -> Status;

    /// Receive the next request (`request_id == 0`) or resume a specific one
    /// into the buffer held by `overlapped`.
    fn receive_request(
        &self,
        queue: QueueHandle,
        request_id: RequestId,
        overlapped: &Overlapped,
    ) -> Receive;

    fn send_response(
        &self,
        queue: QueueHandle,
        request_id: RequestId,
        response: &NativeResponse,
    ) -> Status;

    /// Reset the connection of a request without responding.
    fn cancel_request(&self, queue: QueueHandle, request_id: RequestId) -> Status;
}
