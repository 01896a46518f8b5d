//! The per-worker accept operation.
//!
//! An [`AcceptContext`] owns one reusable receive: a completion slot, the
//! current request buffer and the request id being resumed. Each call to
//! [`AcceptContext::accept_next`] issues a kernel receive and resolves with a
//! [`RequestContext`] once the kernel has written a whole request.
//!
//! Receives are retried without surfacing anything to the caller when the
//! kernel asks for a bigger buffer, or when a connection vanished between a
//! "more data" answer and the retry. Completion either happens inline on the
//! issuing thread or later through [`Overlapped::complete`] on whatever
//! thread the transport delivers notifications on.
//!
//! At most one kernel completion may be outstanding per context. That is
//! tracked with a counter that is set right before every kernel call and
//! cleared exactly once per call, and any mismatch is reported to the
//! listener's [`ViolationPolicy`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::buffer::NativeRequestBuffer;
use crate::completion::CompletionSource;
use crate::error::{CompletionError, Error, Result, TransportError};
use crate::listener::Listener;
use crate::request::RequestContext;
use crate::transport::{RequestId, Status};

const RECEIVE: &str = "HttpReceiveHttpRequest";

/// A broken accept protocol invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A receive was about to be issued while a completion was still expected.
    CompletionAlreadyExpected,
    /// A completion arrived, or a retry cleared the expectation, with none
    /// outstanding.
    CompletionNotExpected,
    /// The completion slot refused an outcome.
    DuplicateCompletion(CompletionError),
    /// `accept_async` was called on a stopped listener.
    AcceptWhileStopped,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::CompletionAlreadyExpected => {
                write!(f, "receive issued while a completion is outstanding")
            }
            ProtocolViolation::CompletionNotExpected => {
                write!(f, "completion observed with none outstanding")
            }
            ProtocolViolation::DuplicateCompletion(err) => {
                write!(f, "completion delivered twice: {}", err)
            }
            ProtocolViolation::AcceptWhileStopped => write!(f, "accept on a stopped listener"),
        }
    }
}

/// Decides what happens when an accept invariant breaks.
pub trait ViolationPolicy: Send + Sync {
    fn report(&self, violation: ProtocolViolation);
}

/// Panics on the first violation. The default for debug builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicOnViolation;

impl ViolationPolicy for PanicOnViolation {
    fn report(&self, violation: ProtocolViolation) {
        panic!("accept protocol violation: {}", violation);
    }
}

/// Logs violations and keeps going. The default for release builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogViolation;

impl ViolationPolicy for LogViolation {
    fn report(&self, violation: ProtocolViolation) {
        log::error!("Accept protocol violation: {}", violation);
    }
}

/// Policy used when none is configured.
pub fn default_policy() -> Arc<dyn ViolationPolicy> {
    if cfg!(debug_assertions) {
        Arc::new(PanicOnViolation)
    } else {
        Arc::new(LogViolation)
    }
}

/// Buffer and resume state of the receive in flight.
struct Native {
    buffer: Option<NativeRequestBuffer>,
    request_id: RequestId,
}

struct AcceptOperation {
    listener: Arc<Listener>,
    source: CompletionSource<RequestContext, Error>,
    /// 1 while a kernel completion is outstanding, 0 otherwise.
    expecting: AtomicUsize,
    native: Mutex<Native>,
}

impl AcceptOperation {
    fn native(&self) -> MutexGuard<'_, Native> {
        self.native.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expect_completion(&self) {
        if self
            .expecting
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.listener
                .policy()
                .report(ProtocolViolation::CompletionAlreadyExpected);
        }
    }

    fn clear_expectation(&self) {
        if self
            .expecting
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.listener
                .policy()
                .report(ProtocolViolation::CompletionNotExpected);
        }
    }

    fn is_completion_expected(&self) -> bool {
        self.expecting.load(Ordering::Acquire) != 0
    }

    /// Makes sure a buffer of `size` bytes (the configured initial size when
    /// `None`) is in place and records the request id to resume.
    fn allocate(&self, size: Option<usize>, request_id: RequestId) {
        let size = size.unwrap_or(self.listener.options().initial_buffer_size);
        let mut native = self.native();
        native.request_id = request_id;
        let reusable = matches!(&native.buffer, Some(buffer) if buffer.size() == size);
        if !reusable {
            // the old buffer goes back to the pool first
            native.buffer = None;
            native.buffer = Some(self.listener.pool().acquire(size));
        }
    }

    /// Request id the kernel left in the current buffer.
    fn buffered_request_id(&self) -> RequestId {
        self.native()
            .buffer
            .as_ref()
            .map(NativeRequestBuffer::request_id)
            .unwrap_or(0)
    }

    /// Issues receives until the kernel accepts one, finishes one inline, or
    /// fails with a status that cannot be retried.
    ///
    /// # Returns
    /// [`Status::SUCCESS`] or [`Status::IO_PENDING`] when the operation is in
    /// the kernel's hands, otherwise the failing status. On failure no
    /// completion is expected any more.
    fn queue_begin_receive(self: &Arc<Self>) -> Status {
        let queue = match self.listener.active_queue() {
            Some(queue) => queue,
            None => return Status::INVALID_HANDLE,
        };
        let overlapped = Overlapped { op: self.clone() };

        loop {
            let request_id = self.native().request_id;

            self.expect_completion();
            let receive = self
                .listener
                .transport()
                .receive_request(queue.handle, request_id, &overlapped);

            match receive.status {
                Status::CONNECTION_INVALID if request_id != 0 => {
                    // the peer went away between the size answer and this retry
                    self.clear_expectation();
                    log::trace!("Request {} vanished before resume, receiving anew", request_id);
                    self.native().request_id = 0;
                }
                Status::MORE_DATA => {
                    self.clear_expectation();
                    let resume = self.buffered_request_id();
                    log::trace!("Request {} needs {} bytes, growing buffer", resume, receive.bytes);
                    self.allocate(Some(receive.bytes), resume);
                }
                Status::SUCCESS if queue.sync_completion => {
                    // no notification will follow
                    self.io_completed(Status::SUCCESS, receive.bytes);
                    return Status::SUCCESS;
                }
                Status::SUCCESS | Status::IO_PENDING => return receive.status,
                status => {
                    self.clear_expectation();
                    return status;
                }
            }
        }
    }

    /// Handles the kernel's answer to an outstanding receive.
    fn io_completed(self: &Arc<Self>, status: Status, bytes: usize) {
        self.clear_expectation();

        let outcome = match status {
            Status::SUCCESS => match self.native().buffer.take() {
                Some(buffer) => Ok(RequestContext::new(self.listener.clone(), buffer)),
                None => Err(TransportError::new(RECEIVE, Status::INVALID_PARAMETER)
                    .with_detail("completion without a buffer")
                    .into()),
            },
            Status::MORE_DATA => {
                let resume = self.buffered_request_id();
                log::trace!("Request {} needs {} bytes, growing buffer", resume, bytes);
                self.allocate(Some(bytes), resume);
                match self.queue_begin_receive() {
                    // still the same accept, its outcome arrives later
                    Status::SUCCESS | Status::IO_PENDING => return,
                    failed => Err(TransportError::new(RECEIVE, failed).into()),
                }
            }
            failed => Err(TransportError::new(RECEIVE, failed).into()),
        };

        let delivered = match outcome {
            Ok(request) => self.source.resolve(request),
            Err(err) => self.source.reject(err),
        };
        if let Err(misuse) = delivered {
            self.listener
                .policy()
                .report(ProtocolViolation::DuplicateCompletion(misuse));
        }
    }
}

/// Handle the transport keeps for an outstanding receive.
///
/// The transport writes the request into [`Overlapped::with_buffer`] and
/// reports the outcome of a pending receive through
/// [`Overlapped::complete`].
#[derive(Clone)]
pub struct Overlapped {
    op: Arc<AcceptOperation>,
}

impl Overlapped {
    /// Runs `f` against the receive buffer, if one is in place.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut NativeRequestBuffer) -> R) -> Option<R> {
        self.op.native().buffer.as_mut().map(f)
    }

    /// Delivers the outcome of a receive that returned
    /// [`Status::IO_PENDING`], or of one that succeeded inline on a queue
    /// without skip-on-success.
    ///
    /// `bytes` is the number of bytes written, or the size needed when
    /// `status` is [`Status::MORE_DATA`].
    pub fn complete(&self, status: Status, bytes: usize) {
        self.op.io_completed(status, bytes);
    }

    pub fn is_completion_expected(&self) -> bool {
        self.op.is_completion_expected()
    }
}

impl fmt::Debug for Overlapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overlapped")
            .field("expecting", &self.op.is_completion_expected())
            .finish()
    }
}

/// Reusable accept state for one worker.
pub struct AcceptContext {
    op: Arc<AcceptOperation>,
}

impl AcceptContext {
    pub fn new(listener: &Arc<Listener>) -> Self {
        Self {
            op: Arc::new(AcceptOperation {
                listener: listener.clone(),
                source: CompletionSource::new(),
                expecting: AtomicUsize::new(0),
                native: Mutex::new(Native {
                    buffer: None,
                    request_id: 0,
                }),
            }),
        }
    }

    /// Receives the next request from the listener's queue.
    ///
    /// # Errors
    /// Returns a [`TransportError`] carrying the kernel status when the
    /// receive fails, e.g. [`Status::OPERATION_ABORTED`] once the queue is
    /// closed.
    pub async fn accept_next(&mut self) -> Result<RequestContext> {
        let token = self.op.source.reset();
        self.op.allocate(None, 0);

        match self.op.queue_begin_receive() {
            Status::SUCCESS | Status::IO_PENDING => self.op.source.wait(token).await,
            failed => Err(TransportError::new(RECEIVE, failed).into()),
        }
    }

    /// Whether a kernel completion is outstanding for this context.
    pub fn is_completion_expected(&self) -> bool {
        self.op.is_completion_expected()
    }
}

impl Drop for AcceptContext {
    fn drop(&mut self) {
        // an outstanding receive still owns the buffer
        if !self.op.is_completion_expected() {
            self.op.native().buffer.take();
        }
    }
}
