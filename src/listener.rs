//! Listener lifecycle: the kernel session, url group and request queue.
//!
//! A listener moves `Stopped -> Started -> Stopped` any number of times and
//! ends in `Disposed`. Starting creates the kernel objects it is missing,
//! applies the configuration and registers the url prefixes. A failed start
//! leaves the listener disposed, it is never half started.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, WWW_AUTHENTICATE};
use hyper::http::{HeaderMap, StatusCode};

use crate::accept::{default_policy, AcceptContext, ProtocolViolation, ViolationPolicy};
use crate::buffer::{BufferPool, MIN_CLASS_SIZE};
use crate::config::ServerConfig;
use crate::error::{Error, Result, TransportError};
use crate::request::RequestContext;
use crate::transport::{
    AuthScheme, Http503Verbosity, KernelTransport, NativeResponse, QueueHandle, QueueProperty,
    RequestId, SessionId, Status, Timeouts, UrlGroupId, UrlGroupProperty,
};

/// Prefix registered when none is configured.
pub const DEFAULT_URL_PREFIX: &str = "http://localhost:5000/";

/// Default admission limit on headers the kernel does not know.
pub const DEFAULT_MAX_UNKNOWN_HEADERS: usize = 1000;

/// Kernel default for the request queue length.
pub const DEFAULT_REQUEST_QUEUE_LIMIT: u64 = 1000;

/// Lifecycle state of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Stopped = 0,
    Started = 1,
    Disposed = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Stopped,
            1 => State::Started,
            _ => State::Disposed,
        }
    }
}

/// Settings applied to the kernel objects at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    pub url_prefixes: Vec<String>,
    pub max_unknown_headers: usize,
    pub allow_anonymous: bool,
    pub authentication_schemes: Vec<AuthScheme>,
    pub request_queue_limit: u64,
    pub max_connections: Option<u64>,
    pub http503_verbosity: Http503Verbosity,
    pub timeouts: Timeouts,
    /// First buffer size tried for every accept.
    pub initial_buffer_size: usize,
    /// Let receives that succeed inline finish without a kernel notification.
    pub skip_completion_on_success: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            url_prefixes: vec![DEFAULT_URL_PREFIX.to_owned()],
            max_unknown_headers: DEFAULT_MAX_UNKNOWN_HEADERS,
            allow_anonymous: true,
            authentication_schemes: Vec::new(),
            request_queue_limit: DEFAULT_REQUEST_QUEUE_LIMIT,
            max_connections: None,
            http503_verbosity: Http503Verbosity::Basic,
            timeouts: Timeouts::default(),
            initial_buffer_size: MIN_CLASS_SIZE,
            skip_completion_on_success: true,
        }
    }
}

impl From<&ServerConfig> for ListenerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            url_prefixes: config.url_prefixes.clone(),
            max_unknown_headers: config.max_unknown_headers,
            allow_anonymous: config.allow_anonymous,
            authentication_schemes: config.authentication_schemes.clone(),
            request_queue_limit: config.request_queue_limit,
            max_connections: config.max_connections,
            http503_verbosity: config.http503_verbosity,
            timeouts: config.timeouts.to_timeouts(),
            initial_buffer_size: config.initial_buffer_size.max(1),
            skip_completion_on_success: config.skip_completion_on_success,
        }
    }
}

/// The request queue while the listener is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActiveQueue {
    pub(crate) handle: QueueHandle,
    /// Receives that succeed inline produce no notification.
    pub(crate) sync_completion: bool,
}

/// Kernel objects that outlive a single start.
#[derive(Default)]
struct KernelObjects {
    session: Option<SessionId>,
    url_group: Option<UrlGroupId>,
}

fn check(operation: &'static str, status: Status) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::new(operation, status).into())
    }
}

/// Owns the kernel objects requests are accepted from.
pub struct Listener {
    transport: Arc<dyn KernelTransport>,
    options: ListenerOptions,
    pool: BufferPool,
    policy: Arc<dyn ViolationPolicy>,
    state: AtomicU8,
    lifecycle: Mutex<KernelObjects>,
    queue: RwLock<Option<ActiveQueue>>,
}

impl Listener {
    /// Creates a stopped listener with the default violation policy.
    pub fn new(transport: Arc<dyn KernelTransport>, options: ListenerOptions) -> Self {
        Self::with_policy(transport, options, default_policy())
    }

    pub fn with_policy(
        transport: Arc<dyn KernelTransport>,
        options: ListenerOptions,
        policy: Arc<dyn ViolationPolicy>,
    ) -> Self {
        Self {
            transport,
            options,
            pool: BufferPool::new(),
            policy,
            state: AtomicU8::new(State::Stopped as u8),
            lifecycle: Mutex::new(KernelObjects::default()),
            queue: RwLock::new(None),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_listening(&self) -> bool {
        self.state() == State::Started
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    pub(crate) fn transport(&self) -> &dyn KernelTransport {
        self.transport.as_ref()
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn policy(&self) -> &dyn ViolationPolicy {
        self.policy.as_ref()
    }

    pub(crate) fn active_queue(&self) -> Option<ActiveQueue> {
        *self.queue.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Creates the kernel objects, applies the configuration and registers
    /// the url prefixes.
    ///
    /// Does nothing when already started.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] on a disposed listener. Any kernel failure
    /// is returned after the listener has been disposed.
    pub fn start(&self) -> Result<()> {
        let (mut objects, poisoned) = match self.lifecycle.lock() {
            Ok(objects) => (objects, false),
            Err(poisoned) => (poisoned.into_inner(), true),
        };
        match self.state() {
            State::Started if !poisoned => return Ok(()),
            State::Disposed => return Err(Error::Closed),
            _ => {}
        }

        let started = if poisoned {
            Err(Error::LockPoisoned)
        } else {
            self.start_locked(&mut objects)
        };
        match started {
            Ok(()) => {
                log::info!("Listening on {}", self.options.url_prefixes.join(", "));
                Ok(())
            }
            Err(err) => {
                self.set_state(State::Disposed);
                self.close_queue();
                self.cleanup_url_group(&mut objects);
                log::error!("Listener failed to start: {}", err);
                Err(err)
            }
        }
    }

    fn start_locked(&self, objects: &mut KernelObjects) -> Result<()> {
        let group = self.ensure_url_group(objects)?;

        let handle = self
            .transport
            .create_request_queue()
            .map_err(|status| TransportError::new("HttpCreateRequestQueue", status))?;
        *self.queue.write().map_err(|_| Error::LockPoisoned)? = Some(ActiveQueue {
            handle,
            sync_completion: false,
        });

        if self.options.skip_completion_on_success {
            check(
                "SetFileCompletionNotificationModes",
                self.transport.enable_skip_completion_on_success(handle),
            )?;
            *self.queue.write().map_err(|_| Error::LockPoisoned)? = Some(ActiveQueue {
                handle,
                sync_completion: true,
            });
        }

        check(
            "HttpSetUrlGroupProperty",
            self.transport
                .set_url_group_property(group, &UrlGroupProperty::Binding(Some(handle))),
        )?;
        self.configure(group, handle)?;

        if let Err(err) = self.register_prefixes(group) {
            self.detach(group);
            return Err(err);
        }

        self.set_state(State::Started);
        Ok(())
    }

    fn ensure_url_group(&self, objects: &mut KernelObjects) -> Result<UrlGroupId> {
        let session = match objects.session {
            Some(session) => session,
            None => {
                let session = self
                    .transport
                    .create_server_session()
                    .map_err(|status| TransportError::new("HttpCreateServerSession", status))?;
                objects.session = Some(session);
                session
            }
        };

        match objects.url_group {
            Some(group) => Ok(group),
            None => {
                let group = self
                    .transport
                    .create_url_group(session)
                    .map_err(|status| TransportError::new("HttpCreateUrlGroup", status))?;
                objects.url_group = Some(group);
                Ok(group)
            }
        }
    }

    fn configure(&self, group: UrlGroupId, queue: QueueHandle) -> Result<()> {
        let options = &self.options;

        if options.request_queue_limit != DEFAULT_REQUEST_QUEUE_LIMIT {
            check(
                "HttpSetRequestQueueProperty",
                self.transport
                    .set_request_queue_property(queue, &QueueProperty::Length(options.request_queue_limit)),
            )?;
        }
        if options.http503_verbosity != Http503Verbosity::Basic {
            check(
                "HttpSetRequestQueueProperty",
                self.transport.set_request_queue_property(
                    queue,
                    &QueueProperty::RejectionVerbosity(options.http503_verbosity),
                ),
            )?;
        }

        let mut properties = Vec::new();
        if let Some(max) = options.max_connections {
            properties.push(UrlGroupProperty::MaxConnections(max));
        }
        if !options.authentication_schemes.is_empty() {
            properties.push(UrlGroupProperty::Authentication(
                options.authentication_schemes.clone(),
            ));
        }
        if !options.timeouts.is_empty() {
            properties.push(UrlGroupProperty::Timeouts(options.timeouts.clone()));
        }
        for property in &properties {
            check(
                "HttpSetUrlGroupProperty",
                self.transport.set_url_group_property(group, property),
            )?;
        }
        Ok(())
    }

    fn register_prefixes(&self, group: UrlGroupId) -> Result<()> {
        for (index, prefix) in self.options.url_prefixes.iter().enumerate() {
            match self.transport.add_url(group, prefix, index as u64) {
                Status::SUCCESS => log::debug!("Registered prefix {}", prefix),
                Status::ALREADY_EXISTS => {
                    return Err(TransportError::new("HttpAddUrlToUrlGroup", Status::ALREADY_EXISTS)
                        .with_detail(format!("prefix {} is already registered", prefix))
                        .into())
                }
                status => {
                    return Err(TransportError::new("HttpAddUrlToUrlGroup", status)
                        .with_detail(format!("prefix {}", prefix))
                        .into())
                }
            }
        }
        Ok(())
    }

    /// Unregisters the prefixes and closes the request queue.
    ///
    /// Receives still pending complete with [`Status::OPERATION_ABORTED`].
    /// Does nothing unless started.
    ///
    /// # Errors
    /// Returns the first kernel failure. The listener is stopped either way.
    pub fn stop(&self) -> Result<()> {
        let objects = self.lifecycle.lock().map_err(|_| Error::LockPoisoned)?;
        if self.state() != State::Started {
            return Ok(());
        }
        log::info!("Stopping listener");
        self.stop_locked(&objects).map_err(|err| {
            log::error!("Listener failed to stop cleanly: {}", err);
            err
        })
    }

    fn stop_locked(&self, objects: &KernelObjects) -> Result<()> {
        let mut first_error: Option<Error> = None;

        if let Some(group) = objects.url_group {
            for prefix in &self.options.url_prefixes {
                match self.transport.remove_url(group, prefix) {
                    Status::SUCCESS | Status::NOT_FOUND => {}
                    status => {
                        first_error.get_or_insert_with(|| {
                            TransportError::new("HttpRemoveUrlFromUrlGroup", status)
                                .with_detail(format!("prefix {}", prefix))
                                .into()
                        });
                    }
                }
            }
        }

        self.set_state(State::Stopped);

        if let Some(group) = objects.url_group {
            self.detach(group);
        }
        if let Some(err) = self.close_queue() {
            first_error.get_or_insert(err);
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Detaches the queue from the url group. Failures are only logged.
    fn detach(&self, group: UrlGroupId) {
        let status = self
            .transport
            .set_url_group_property(group, &UrlGroupProperty::Binding(None));
        if !status.is_success() {
            log::warn!("Failed to detach request queue: {}", status);
        }
    }

    fn close_queue(&self) -> Option<Error> {
        let queue = self
            .queue
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match self.transport.close_request_queue(queue.handle) {
            Status::SUCCESS => None,
            status => Some(TransportError::new("CloseHandle", status).into()),
        }
    }

    fn cleanup_url_group(&self, objects: &mut KernelObjects) {
        if let Some(group) = objects.url_group.take() {
            let status = self.transport.close_url_group(group);
            if !status.is_success() {
                log::warn!("Failed to close url group: {}", status);
            }
        }
        if let Some(session) = objects.session.take() {
            let status = self.transport.close_server_session(session);
            if !status.is_success() {
                log::warn!("Failed to close server session: {}", status);
            }
        }
    }

    /// Stops if started and releases every kernel object. Idempotent.
    ///
    /// # Errors
    /// Returns the stop failure, if any. The listener is disposed either way.
    pub fn dispose(&self) -> Result<()> {
        let mut objects = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() == State::Disposed {
            return Ok(());
        }
        log::info!("Disposing listener");

        let stopped = if self.state() == State::Started {
            self.stop_locked(&objects)
        } else {
            Ok(())
        };
        self.cleanup_url_group(&mut objects);
        self.set_state(State::Disposed);

        if let Err(err) = &stopped {
            log::error!("Listener failed to stop cleanly while disposing: {}", err);
        }
        stopped
    }

    /// Receives the next request through `context`.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] once disposed, [`Error::NotListening`] while
    /// stopped, and the accept failure otherwise.
    pub async fn accept_async(&self, context: &mut AcceptContext) -> Result<RequestContext> {
        if self.state() == State::Stopped {
            self.policy.report(ProtocolViolation::AcceptWhileStopped);
        }
        self.accept_listening(context).await
    }

    /// Accept path for loops that race with [`stop`](Listener::stop): a
    /// stopped listener is their signal to exit, not a caller bug.
    pub(crate) async fn accept_listening(&self, context: &mut AcceptContext) -> Result<RequestContext> {
        match self.state() {
            State::Disposed => Err(Error::Closed),
            State::Stopped => Err(Error::NotListening),
            State::Started => context.accept_next().await,
        }
    }

    /// Applies the admission rules to a freshly accepted request.
    ///
    /// Returns `false` when the request was rejected. In that case an error
    /// response has been sent, the buffer released, and the request must not
    /// be dispatched.
    pub fn validate_request(&self, request: &mut RequestContext) -> bool {
        let unknown = request.unknown_header_count();
        if unknown > self.options.max_unknown_headers {
            log::debug!(
                "Rejecting request {}: {} unknown headers exceeds limit of {}",
                request.request_id(),
                unknown,
                self.options.max_unknown_headers
            );
            request.reject(StatusCode::BAD_REQUEST, &[]);
            return false;
        }

        if !self.options.allow_anonymous && !request.is_authenticated() {
            log::debug!("Rejecting anonymous request {}", request.request_id());
            request.reject(StatusCode::UNAUTHORIZED, &self.options.authentication_schemes);
            return false;
        }

        true
    }

    /// Writes a bodyless error response straight to the kernel, cancelling
    /// the request if that fails.
    pub(crate) fn send_error(&self, request_id: RequestId, status: StatusCode, challenges: &[AuthScheme]) {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        for scheme in challenges {
            headers.append(WWW_AUTHENTICATE, HeaderValue::from_static(scheme.challenge()));
        }
        let response = NativeResponse {
            status,
            headers,
            body: Bytes::new(),
        };

        if let Err(err) = self.send_response(request_id, &response) {
            log::warn!(
                "Failed to send {} for request {}, cancelling: {}",
                status,
                request_id,
                err
            );
            if let Err(err) = self.cancel_request(request_id) {
                log::debug!("Failed to cancel request {}: {}", request_id, err);
            }
        }
    }

    pub(crate) fn send_response(&self, request_id: RequestId, response: &NativeResponse) -> Result<()> {
        let queue = self.active_queue().ok_or(Error::NotListening)?;
        check(
            "HttpSendHttpResponse",
            self.transport.send_response(queue.handle, request_id, response),
        )
    }

    pub(crate) fn cancel_request(&self, request_id: RequestId) -> Result<()> {
        let queue = self.active_queue().ok_or(Error::NotListening)?;
        check(
            "HttpCancelHttpRequest",
            self.transport.cancel_request(queue.handle, request_id),
        )
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("state", &self.state())
            .field("queue", &self.active_queue())
            .field("options", &self.options)
            .finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            log::error!("Error disposing listener: {}", err);
        }
    }
}
