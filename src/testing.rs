//! A scripted kernel for unit tests.
//!
//! [`ScriptedTransport`] answers receives from a queue of [`Step`]s and
//! records every call, so tests can assert on the exact sequence of request
//! ids and buffer sizes the accept path used.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::accept::{Overlapped, ProtocolViolation, ViolationPolicy};
use crate::buffer::NativeRequestHeader;
use crate::transport::{
    KernelTransport, NativeResponse, QueueHandle, QueueProperty, Receive, RequestId, SessionId,
    Status, UrlGroupId, UrlGroupProperty,
};

/// What the kernel does with the next receive.
pub(crate) enum Step {
    /// Write the request if it fits, otherwise answer "more data" with the
    /// size needed and `request_id` in the buffer header.
    Deliver { request_id: RequestId, head: Vec<u8> },
    /// Fail inline with a status.
    Fail(Status),
    /// Go pending and keep the overlapped for the test to finish.
    Park,
}

impl Step {
    pub(crate) fn deliver(request_id: RequestId, head: &[u8]) -> Self {
        Step::Deliver {
            request_id,
            head: head.to_vec(),
        }
    }
}

/// One `receive_request` call as the kernel saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReceiveCall {
    pub(crate) request_id: RequestId,
    pub(crate) buffer_size: usize,
    /// Whether the accept path had marked a completion as expected.
    pub(crate) expecting: bool,
}

/// A request head of exactly `len` bytes.
pub(crate) fn padded_head(len: usize) -> Vec<u8> {
    let frame = b"GET / HTTP/1.1\r\nX-Pad: \r\n\r\n".len();
    assert!(len >= frame, "head of {} bytes is too short", len);
    let mut head = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
    head.extend(std::iter::repeat(b'a').take(len - frame));
    head.extend_from_slice(b"\r\n\r\n");
    head
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<ReceiveCall>>,
    parked: Mutex<VecDeque<Overlapped>>,
    skip_on_success: AtomicBool,
    fail_sends: AtomicBool,
    conflict: Mutex<Option<String>>,
    prefixes: Mutex<Vec<(String, u64)>>,
    url_group_properties: Mutex<Vec<UrlGroupProperty>>,
    queue_properties: Mutex<Vec<QueueProperty>>,
    sent: Mutex<Vec<(RequestId, NativeResponse)>>,
    cancelled: Mutex<Vec<RequestId>>,
    next_handle: AtomicU64,
    sessions_closed: AtomicUsize,
    url_groups_created: AtomicUsize,
    url_groups_closed: AtomicUsize,
    queues_created: AtomicUsize,
    queues_closed: AtomicUsize,
    after_receive: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Make `add_url` report that `prefix` belongs to someone else.
    pub(crate) fn conflict_on(&self, prefix: &str) {
        *self.conflict.lock().unwrap() = Some(prefix.to_owned());
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Runs `hook` once, at the end of the next receive, after its outcome
    /// has been decided.
    pub(crate) fn after_next_receive(&self, hook: impl FnOnce() + Send + 'static) {
        *self.after_receive.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn calls(&self) -> Vec<ReceiveCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn sent(&self) -> Vec<(RequestId, NativeResponse)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<RequestId> {
        self.cancelled.lock().unwrap().clone()
    }

    pub(crate) fn prefixes(&self) -> Vec<(String, u64)> {
        self.prefixes.lock().unwrap().clone()
    }

    pub(crate) fn url_group_properties(&self) -> Vec<UrlGroupProperty> {
        self.url_group_properties.lock().unwrap().clone()
    }

    pub(crate) fn queue_properties(&self) -> Vec<QueueProperty> {
        self.queue_properties.lock().unwrap().clone()
    }

    pub(crate) fn sessions_closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn url_groups_created(&self) -> usize {
        self.url_groups_created.load(Ordering::SeqCst)
    }

    pub(crate) fn url_groups_closed(&self) -> usize {
        self.url_groups_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn queues_created(&self) -> usize {
        self.queues_created.load(Ordering::SeqCst)
    }

    pub(crate) fn queues_closed(&self) -> usize {
        self.queues_closed.load(Ordering::SeqCst)
    }

    /// Blocks until a receive is pending.
    pub(crate) fn wait_for_parked(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.parked.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "no receive went pending");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Removes the oldest pending receive without completing it.
    pub(crate) fn take_parked(&self) -> Overlapped {
        self.wait_for_parked();
        self.parked.lock().unwrap().pop_front().unwrap()
    }

    /// Completes the oldest pending receive as `step` describes.
    pub(crate) fn finish_parked(&self, step: Step) {
        let overlapped = self.take_parked();
        let receive = self.apply(step, &overlapped);
        overlapped.complete(receive.status, receive.bytes);
    }

    fn apply(&self, step: Step, overlapped: &Overlapped) -> Receive {
        match step {
            Step::Deliver { request_id, head } => {
                let header = NativeRequestHeader {
                    request_id,
                    connection_id: request_id,
                    ..Default::default()
                };
                match overlapped.with_buffer(|buffer| buffer.fill(header, &head)) {
                    Some(Ok(written)) => Receive::new(Status::SUCCESS, written),
                    Some(Err(needed)) => Receive::new(Status::MORE_DATA, needed),
                    None => Receive::new(Status::INVALID_PARAMETER, 0),
                }
            }
            Step::Fail(status) => Receive::new(status, 0),
            Step::Park => {
                self.parked.lock().unwrap().push_back(overlapped.clone());
                Receive::pending()
            }
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl KernelTransport for ScriptedTransport {
    fn create_server_session(&self) -> Result<SessionId, Status> {
        Ok(SessionId(self.handle()))
    }

    fn close_server_session(&self, _session: SessionId) -> Status {
        self.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Status::SUCCESS
    }

    fn create_url_group(&self, _session: SessionId) -> Result<UrlGroupId, Status> {
        self.url_groups_created.fetch_add(1, Ordering::SeqCst);
        Ok(UrlGroupId(self.handle()))
    }

    fn close_url_group(&self, _group: UrlGroupId) -> Status {
        self.url_groups_closed.fetch_add(1, Ordering::SeqCst);
        self.prefixes.lock().unwrap().clear();
        Status::SUCCESS
    }

    fn set_url_group_property(&self, _group: UrlGroupId, property: &UrlGroupProperty) -> Status {
        self.url_group_properties.lock().unwrap().push(property.clone());
        Status::SUCCESS
    }

    fn add_url(&self, _group: UrlGroupId, prefix: &str, context: u64) -> Status {
        if self.conflict.lock().unwrap().as_deref() == Some(prefix) {
            return Status::ALREADY_EXISTS;
        }
        self.prefixes.lock().unwrap().push((prefix.to_owned(), context));
        Status::SUCCESS
    }

    fn remove_url(&self, _group: UrlGroupId, prefix: &str) -> Status {
        let mut prefixes = self.prefixes.lock().unwrap();
        match prefixes.iter().position(|(registered, _)| registered == prefix) {
            Some(index) => {
                prefixes.remove(index);
                Status::SUCCESS
            }
            None => Status::NOT_FOUND,
        }
    }

    fn create_request_queue(&self) -> Result<QueueHandle, Status> {
        self.queues_created.fetch_add(1, Ordering::SeqCst);
        Ok(QueueHandle(self.handle()))
    }

    fn enable_skip_completion_on_success(&self, _queue: QueueHandle) -> Status {
        self.skip_on_success.store(true, Ordering::SeqCst);
        Status::SUCCESS
    }

    fn set_request_queue_property(&self, _queue: QueueHandle, property: &QueueProperty) -> Status {
        self.queue_properties.lock().unwrap().push(*property);
        Status::SUCCESS
    }

    fn close_request_queue(&self, _queue: QueueHandle) -> Status {
        self.queues_closed.fetch_add(1, Ordering::SeqCst);
        self.skip_on_success.store(false, Ordering::SeqCst);
        let parked: Vec<_> = self.parked.lock().unwrap().drain(..).collect();
        for overlapped in parked {
            std::thread::spawn(move || overlapped.complete(Status::OPERATION_ABORTED, 0));
        }
        Status::SUCCESS
    }

    fn receive_request(&self, _queue: QueueHandle, request_id: RequestId, overlapped: &Overlapped) -> Receive {
        self.calls.lock().unwrap().push(ReceiveCall {
            request_id,
            buffer_size: overlapped.with_buffer(|buffer| buffer.size()).unwrap_or(0),
            expecting: overlapped.is_completion_expected(),
        });

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Park);
        let receive = self.apply(step, overlapped);

        if receive.status.is_success() && !self.skip_on_success.load(Ordering::SeqCst) {
            let overlapped = overlapped.clone();
            std::thread::spawn(move || overlapped.complete(receive.status, receive.bytes));
        }

        let hook = self.after_receive.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        receive
    }

    fn send_response(&self, _queue: QueueHandle, request_id: RequestId, response: &NativeResponse) -> Status {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Status::CONNECTION_INVALID;
        }
        self.sent.lock().unwrap().push((request_id, response.clone()));
        Status::SUCCESS
    }

    fn cancel_request(&self, _queue: QueueHandle, request_id: RequestId) -> Status {
        self.cancelled.lock().unwrap().push(request_id);
        Status::SUCCESS
    }
}

/// Collects violations instead of acting on them.
#[derive(Default)]
pub(crate) struct RecordingPolicy {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl RecordingPolicy {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().unwrap().clone()
    }
}

impl ViolationPolicy for RecordingPolicy {
    fn report(&self, violation: ProtocolViolation) {
        self.violations.lock().unwrap().push(violation);
    }
}
