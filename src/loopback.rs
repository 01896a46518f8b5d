//! An in-process kernel request queue.
//!
//! [`LoopbackTransport`] implements [`KernelTransport`] entirely in memory so
//! the engine can run without the kernel driver: requests are submitted with
//! [`LoopbackTransport::submit`], routed by url prefix, written into the
//! receiver's buffer with the same "more data" negotiation the driver does,
//! and completed through a [`CompletionPort`] thread. Responses and
//! cancellations are recorded for inspection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use hyper::body::Bytes;
use hyper::http::{HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;

use crate::accept::Overlapped;
use crate::buffer::NativeRequestHeader;
use crate::error::PortResult;
use crate::port::CompletionPort;
use crate::transport::{
    AuthScheme, Http503Verbosity, KernelTransport, NativeResponse, QueueHandle, QueueProperty,
    Receive, RequestId, SessionId, Status, Timeouts, UrlGroupId, UrlGroupProperty,
};

/// Request headers the kernel parses into known slots. Anything else counts
/// as unknown.
const KNOWN_REQUEST_HEADERS: &[&str] = &[
    "cache-control",
    "connection",
    "date",
    "keep-alive",
    "pragma",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "via",
    "warning",
    "allow",
    "content-length",
    "content-type",
    "content-encoding",
    "content-language",
    "content-location",
    "content-md5",
    "content-range",
    "expires",
    "last-modified",
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "authorization",
    "cookie",
    "expect",
    "from",
    "host",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-range",
    "if-unmodified-since",
    "max-forwards",
    "proxy-authorization",
    "referer",
    "range",
    "te",
    "translate",
    "user-agent",
];

const DEFAULT_QUEUE_LENGTH: u64 = 1000;

/// Why a submitted request was not queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("no registered prefix matches {0}")]
    NotRouted(String),

    /// The request queue is at its length limit
    #[error("request queue is full")]
    QueueFull,
}

/// A request as a client would send it.
#[derive(Debug, Clone)]
pub struct LoopbackRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    authenticated: bool,
}

impl LoopbackRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            authenticated: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Mark the request as authenticated by the kernel.
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    fn unknown_header_count(&self) -> usize {
        self.headers
            .iter()
            .filter(|(name, _)| !KNOWN_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
            .count()
    }

    /// Serializes the request line and headers the way the kernel hands
    /// them over.
    fn encode(&self, uri: &Uri) -> Vec<u8> {
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, path);
        let has_host = self
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("host"));
        if !has_host {
            if let Some(authority) = uri.authority() {
                head.push_str(&format!("Host: {}\r\n", authority));
            }
        }
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// A response the server sent.
#[derive(Debug, Clone)]
pub struct SentResponse {
    pub request_id: RequestId,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SentResponse {
    /// Status line as it goes on the wire.
    pub fn status_line(&self) -> String {
        format!(
            "HTTP/1.1 {} {}",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        )
    }
}

struct Incoming {
    header: NativeRequestHeader,
    head: Vec<u8>,
}

struct Queue {
    pending: VecDeque<Incoming>,
    /// Requests that did not fit the receiver's buffer, by id.
    held: HashMap<RequestId, Incoming>,
    waiters: VecDeque<Overlapped>,
    skip_on_success: bool,
    length: u64,
    verbosity: Http503Verbosity,
}

impl Queue {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            held: HashMap::new(),
            waiters: VecDeque::new(),
            skip_on_success: false,
            length: DEFAULT_QUEUE_LENGTH,
            verbosity: Http503Verbosity::Basic,
        }
    }

    /// Writes `incoming` into the receiver's buffer, holding it back when it
    /// does not fit.
    fn deliver(&mut self, incoming: Incoming, overlapped: &Overlapped) -> Receive {
        match overlapped.with_buffer(|buffer| buffer.fill(incoming.header, &incoming.head)) {
            Some(Ok(written)) => Receive::new(Status::SUCCESS, written),
            Some(Err(needed)) => {
                self.held.insert(incoming.header.request_id, incoming);
                Receive::new(Status::MORE_DATA, needed)
            }
            None => {
                self.pending.push_front(incoming);
                Receive::new(Status::INVALID_PARAMETER, 0)
            }
        }
    }
}

#[derive(Default)]
struct Group {
    session: u64,
    queue: Option<u64>,
    prefixes: Vec<(String, u64)>,
    authentication: Vec<AuthScheme>,
    timeouts: Timeouts,
    max_connections: Option<u64>,
}

#[derive(Default)]
struct Kernel {
    next_id: u64,
    sessions: HashSet<u64>,
    groups: HashMap<u64, Group>,
    queues: HashMap<u64, Queue>,
    reserved: HashSet<String>,
    sent: Vec<SentResponse>,
    cancelled: Vec<RequestId>,
    fail_responses: bool,
}

impl Kernel {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_registered(&self, prefix: &str) -> bool {
        self.reserved.contains(prefix)
            || self
                .groups
                .values()
                .any(|group| group.prefixes.iter().any(|(registered, _)| registered == prefix))
    }

    /// Longest registered prefix matching `url` on a group bound to a queue.
    fn route(&self, url: &Url) -> Option<(u64, u64)> {
        let mut best: Option<(usize, u64, u64)> = None;
        for group in self.groups.values() {
            let queue = match group.queue {
                Some(queue) => queue,
                None => continue,
            };
            for (prefix, context) in &group.prefixes {
                let prefix = match Url::parse(prefix) {
                    Some(prefix) => prefix,
                    None => continue,
                };
                if prefix.matches(url) && best.map_or(true, |(len, _, _)| prefix.path.len() > len) {
                    best = Some((prefix.path.len(), queue, *context));
                }
            }
        }
        best.map(|(_, queue, context)| (queue, context))
    }
}

/// The parts of a url that prefix routing looks at.
struct Url {
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

impl Url {
    fn parse(url: &str) -> Option<Url> {
        let (scheme, rest) = url.split_once("://")?;
        let scheme = scheme.to_ascii_lowercase();
        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, if scheme == "https" { 443 } else { 80 }),
        };
        let path = path.split(['?', '#']).next().unwrap_or("/");
        Some(Url {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            path: path.to_ascii_lowercase(),
        })
    }

    /// Whether this prefix covers `url`. `+` and `*` hosts match any host.
    fn matches(&self, url: &Url) -> bool {
        let host_matches = self.host == "+" || self.host == "*" || self.host == url.host;
        let path = self.path.trim_end_matches('/');
        let path_matches = url.path.starts_with(path)
            && matches!(url.path.as_bytes().get(path.len()), None | Some(b'/'));
        self.scheme == url.scheme && self.port == url.port && host_matches && path_matches
    }
}

/// In-memory implementation of [`KernelTransport`].
pub struct LoopbackTransport {
    kernel: Mutex<Kernel>,
    port: CompletionPort,
}

impl LoopbackTransport {
    /// Creates an empty kernel with its own completion port thread.
    ///
    /// # Errors
    /// Returns the port error if the completion thread cannot be started.
    pub fn new() -> PortResult<Self> {
        Ok(Self {
            kernel: Mutex::new(Kernel::default()),
            port: CompletionPort::new()?,
        })
    }

    fn kernel(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, overlapped: Overlapped, status: Status, bytes: usize) {
        if let Err(err) = self.port.post_completion(overlapped, status, bytes) {
            log::warn!("Dropping completion {}: {}", status, err);
        }
    }

    /// Queues a request as if a client had sent it.
    ///
    /// # Returns
    /// The kernel request id assigned to it.
    ///
    /// # Errors
    /// Returns a [`SubmitError`] if the url is malformed, no registered
    /// prefix routes it, or the queue is full.
    pub fn submit(&self, request: LoopbackRequest) -> Result<RequestId, SubmitError> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|_| SubmitError::InvalidUrl(request.url.clone()))?;
        let url = Url::parse(&request.url).ok_or_else(|| SubmitError::InvalidUrl(request.url.clone()))?;

        let mut kernel = self.kernel();
        let (queue_id, url_context) = kernel
            .route(&url)
            .ok_or_else(|| SubmitError::NotRouted(request.url.clone()))?;
        let request_id = kernel.next_id();
        let connection_id = kernel.next_id();

        let incoming = Incoming {
            header: NativeRequestHeader {
                request_id,
                connection_id,
                url_context,
                unknown_header_count: u16::try_from(request.unknown_header_count()).unwrap_or(u16::MAX),
                authenticated: request.authenticated,
            },
            head: request.encode(&uri),
        };

        let queue = kernel
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| SubmitError::NotRouted(request.url.clone()))?;

        match queue.waiters.pop_front() {
            Some(waiter) => {
                let receive = queue.deliver(incoming, &waiter);
                drop(kernel);
                self.notify(waiter, receive.status, receive.bytes);
            }
            None => {
                if queue.pending.len() as u64 >= queue.length {
                    return Err(SubmitError::QueueFull);
                }
                queue.pending.push_back(incoming);
            }
        }

        log::trace!("Queued request {} for {}", request_id, request.url);
        Ok(request_id)
    }

    /// Simulates another process owning `prefix`.
    pub fn reserve_prefix(&self, prefix: &str) {
        self.kernel().reserved.insert(prefix.to_ascii_lowercase());
    }

    /// Drops a request held for a bigger buffer, as if its client reset the
    /// connection. Returns whether it was held.
    pub fn reset_connection(&self, request_id: RequestId) -> bool {
        self.kernel()
            .queues
            .values_mut()
            .any(|queue| queue.held.remove(&request_id).is_some())
    }

    /// Makes every response send fail until turned off again.
    pub fn fail_responses(&self, fail: bool) {
        self.kernel().fail_responses = fail;
    }

    pub fn sent_responses(&self) -> Vec<SentResponse> {
        self.kernel().sent.clone()
    }

    pub fn cancelled_requests(&self) -> Vec<RequestId> {
        self.kernel().cancelled.clone()
    }

    /// Prefixes currently registered, with their context values.
    pub fn registered_prefixes(&self) -> Vec<(String, u64)> {
        let kernel = self.kernel();
        let mut prefixes: Vec<_> = kernel
            .groups
            .values()
            .flat_map(|group| group.prefixes.iter().cloned())
            .collect();
        prefixes.sort();
        prefixes
    }

    /// Requests waiting for a receive across all queues.
    pub fn pending_requests(&self) -> usize {
        self.kernel().queues.values().map(|queue| queue.pending.len()).sum()
    }

    /// Receives waiting for a request across all queues.
    pub fn waiting_receivers(&self) -> usize {
        self.kernel().queues.values().map(|queue| queue.waiters.len()).sum()
    }

    pub fn open_queues(&self) -> usize {
        self.kernel().queues.len()
    }

    /// Length limit and 503 verbosity of every open queue.
    pub fn queue_settings(&self) -> Vec<(u64, Http503Verbosity)> {
        self.kernel()
            .queues
            .values()
            .map(|queue| (queue.length, queue.verbosity))
            .collect()
    }

    /// Authentication schemes configured on any url group.
    pub fn authentication_schemes(&self) -> Vec<AuthScheme> {
        self.kernel()
            .groups
            .values()
            .flat_map(|group| group.authentication.iter().copied())
            .collect()
    }

    /// Connection limit configured on any url group.
    pub fn max_connections(&self) -> Option<u64> {
        self.kernel().groups.values().find_map(|group| group.max_connections)
    }

    /// Timeouts configured on any url group.
    pub fn timeouts(&self) -> Option<Timeouts> {
        self.kernel()
            .groups
            .values()
            .map(|group| group.timeouts.clone())
            .find(|timeouts| !timeouts.is_empty())
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kernel = self.kernel();
        f.debug_struct("LoopbackTransport")
            .field("sessions", &kernel.sessions.len())
            .field("groups", &kernel.groups.len())
            .field("queues", &kernel.queues.len())
            .finish()
    }
}

impl KernelTransport for LoopbackTransport {
    fn create_server_session(&self) -> Result<SessionId, Status> {
        let mut kernel = self.kernel();
        let id = kernel.next_id();
        kernel.sessions.insert(id);
        Ok(SessionId(id))
    }

    fn close_server_session(&self, session: SessionId) -> Status {
        let mut kernel = self.kernel();
        if !kernel.sessions.remove(&session.0) {
            return Status::INVALID_HANDLE;
        }
        kernel.groups.retain(|_, group| group.session != session.0);
        Status::SUCCESS
    }

    fn create_url_group(&self, session: SessionId) -> Result<UrlGroupId, Status> {
        let mut kernel = self.kernel();
        if !kernel.sessions.contains(&session.0) {
            return Err(Status::INVALID_HANDLE);
        }
        let id = kernel.next_id();
        kernel.groups.insert(
            id,
            Group {
                session: session.0,
                ..Default::default()
            },
        );
        Ok(UrlGroupId(id))
    }

    fn close_url_group(&self, group: UrlGroupId) -> Status {
        match self.kernel().groups.remove(&group.0) {
            Some(_) => Status::SUCCESS,
            None => Status::INVALID_HANDLE,
        }
    }

    fn set_url_group_property(&self, group: UrlGroupId, property: &UrlGroupProperty) -> Status {
        let mut kernel = self.kernel();
        if let UrlGroupProperty::Binding(Some(queue)) = property {
            if !kernel.queues.contains_key(&queue.0) {
                return Status::INVALID_PARAMETER;
            }
        }
        let group = match kernel.groups.get_mut(&group.0) {
            Some(group) => group,
            None => return Status::INVALID_HANDLE,
        };
        match property {
            UrlGroupProperty::Binding(queue) => group.queue = queue.map(|queue| queue.0),
            UrlGroupProperty::Authentication(schemes) => group.authentication = schemes.clone(),
            UrlGroupProperty::Timeouts(timeouts) => group.timeouts = timeouts.clone(),
            UrlGroupProperty::MaxConnections(max) => group.max_connections = Some(*max),
        }
        Status::SUCCESS
    }

    fn add_url(&self, group: UrlGroupId, prefix: &str, context: u64) -> Status {
        let prefix = prefix.to_ascii_lowercase();
        if Url::parse(&prefix).is_none() {
            return Status::INVALID_PARAMETER;
        }
        let mut kernel = self.kernel();
        if kernel.is_registered(&prefix) {
            return Status::ALREADY_EXISTS;
        }
        match kernel.groups.get_mut(&group.0) {
            Some(group) => {
                group.prefixes.push((prefix, context));
                Status::SUCCESS
            }
            None => Status::INVALID_HANDLE,
        }
    }

    fn remove_url(&self, group: UrlGroupId, prefix: &str) -> Status {
        let prefix = prefix.to_ascii_lowercase();
        let mut kernel = self.kernel();
        let group = match kernel.groups.get_mut(&group.0) {
            Some(group) => group,
            None => return Status::INVALID_HANDLE,
        };
        match group.prefixes.iter().position(|(registered, _)| *registered == prefix) {
            Some(index) => {
                group.prefixes.remove(index);
                Status::SUCCESS
            }
            None => Status::NOT_FOUND,
        }
    }

    fn create_request_queue(&self) -> Result<QueueHandle, Status> {
        let mut kernel = self.kernel();
        let id = kernel.next_id();
        kernel.queues.insert(id, Queue::new());
        Ok(QueueHandle(id))
    }

    fn enable_skip_completion_on_success(&self, queue: QueueHandle) -> Status {
        match self.kernel().queues.get_mut(&queue.0) {
            Some(queue) => {
                queue.skip_on_success = true;
                Status::SUCCESS
            }
            None => Status::INVALID_HANDLE,
        }
    }

    fn set_request_queue_property(&self, queue: QueueHandle, property: &QueueProperty) -> Status {
        let mut kernel = self.kernel();
        let queue = match kernel.queues.get_mut(&queue.0) {
            Some(queue) => queue,
            None => return Status::INVALID_HANDLE,
        };
        match *property {
            QueueProperty::Length(0) => return Status::INVALID_PARAMETER,
            QueueProperty::Length(length) => queue.length = length,
            QueueProperty::RejectionVerbosity(verbosity) => queue.verbosity = verbosity,
        }
        Status::SUCCESS
    }

    fn close_request_queue(&self, queue: QueueHandle) -> Status {
        let mut kernel = self.kernel();
        let closed = match kernel.queues.remove(&queue.0) {
            Some(closed) => closed,
            None => return Status::INVALID_HANDLE,
        };
        for group in kernel.groups.values_mut() {
            if group.queue == Some(queue.0) {
                group.queue = None;
            }
        }
        drop(kernel);

        let dropped = closed.pending.len() + closed.held.len();
        if dropped > 0 {
            log::debug!("Closing request queue dropped {} requests", dropped);
        }
        for waiter in closed.waiters {
            self.notify(waiter, Status::OPERATION_ABORTED, 0);
        }
        Status::SUCCESS
    }

    fn receive_request(&self, queue: QueueHandle, request_id: RequestId, overlapped: &Overlapped) -> Receive {
        let mut kernel = self.kernel();
        let queue = match kernel.queues.get_mut(&queue.0) {
            Some(queue) => queue,
            None => return Receive::new(Status::INVALID_HANDLE, 0),
        };

        let incoming = if request_id != 0 {
            match queue.held.remove(&request_id) {
                Some(incoming) => incoming,
                None => return Receive::new(Status::CONNECTION_INVALID, 0),
            }
        } else {
            match queue.pending.pop_front() {
                Some(incoming) => incoming,
                None => {
                    queue.waiters.push_back(overlapped.clone());
                    return Receive::pending();
                }
            }
        };

        let receive = queue.deliver(incoming, overlapped);
        let notify = receive.status.is_success() && !queue.skip_on_success;
        drop(kernel);

        if notify {
            self.notify(overlapped.clone(), receive.status, receive.bytes);
        }
        receive
    }

    fn send_response(&self, queue: QueueHandle, request_id: RequestId, response: &NativeResponse) -> Status {
        let mut kernel = self.kernel();
        if !kernel.queues.contains_key(&queue.0) {
            return Status::INVALID_HANDLE;
        }
        if kernel.fail_responses {
            return Status::CONNECTION_INVALID;
        }
        kernel.sent.push(SentResponse {
            request_id,
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
        });
        Status::SUCCESS
    }

    fn cancel_request(&self, queue: QueueHandle, request_id: RequestId) -> Status {
        let mut kernel = self.kernel();
        match kernel.queues.get_mut(&queue.0) {
            Some(queue) => {
                queue.held.remove(&request_id);
            }
            None => return Status::INVALID_HANDLE,
        }
        kernel.cancelled.push(request_id);
        Status::SUCCESS
    }
}
