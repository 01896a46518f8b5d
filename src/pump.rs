//! The accept pump: a pool of accept loops feeding the application.
//!
//! [`Pump::start`] spawns one accept loop per configured accept slot on the
//! current tokio runtime. Each loop owns an [`AcceptContext`], validates what
//! it receives and hands every admitted request to the dispatch
//! [`Executor`], then goes straight back to accepting.
//!
//! Shutdown is a drain: [`Pump::stop`] stops new work from being dispatched
//! and waits until every dispatched request has finished, or until the
//! caller's deadline fires. The listener itself is only torn down by
//! [`Pump::dispose`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use hyper::http::StatusCode;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accept::AcceptContext;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::listener::Listener;
use crate::request::RequestContext;

/// Error type applications report failures with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The application requests are dispatched to.
///
/// For every admitted request the pump calls `create_context`, then
/// `process_request`, then `dispose_context` with the failure, if any.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Per-request state.
    type Context: Send + 'static;

    fn create_context(&self, request: &RequestContext) -> Self::Context;

    /// Handles one request. A request left unanswered is completed with an
    /// empty `200 OK`, or `500` if this returns an error or panics.
    async fn process_request(
        &self,
        context: &mut Self::Context,
        request: &mut RequestContext,
    ) -> std::result::Result<(), BoxError>;

    fn dispose_context(&self, context: Self::Context, error: Option<&BoxError>) {
        let _ = (context, error);
    }
}

/// Sizing and timing of a [`Pump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpSettings {
    /// Concurrent accept loops.
    pub max_accepts: usize,
    pub max_dispatch_threads: usize,
    pub dispatch_keep_alive: Duration,
    /// Drain deadline used by [`Pump::shutdown`].
    pub shutdown_timeout: Duration,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            max_accepts: num_cpus::get() * 5,
            max_dispatch_threads: num_cpus::get() * 15,
            dispatch_keep_alive: Duration::from_secs(6),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ServerConfig> for PumpSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_accepts: config.max_accepts,
            max_dispatch_threads: config.max_dispatch_threads,
            dispatch_keep_alive: config.dispatch_keep_alive(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every dispatched request finished.
    Drained,
    /// The deadline fired first; `outstanding` requests were left running.
    Abandoned { outstanding: usize },
}

/// One-shot shutdown signal.
struct ShutdownSignal {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    /// Fires the signal. Returns `false` if it had already fired.
    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Shared {
    stopping: AtomicBool,
    outstanding: AtomicUsize,
    live_workers: AtomicUsize,
    shutdown: ShutdownSignal,
}

impl Shared {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn begin_request(self: &Arc<Self>) -> Outstanding {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Outstanding {
            shared: self.clone(),
        }
    }

    fn enter_worker(self: &Arc<Self>) -> LiveWorker {
        self.live_workers.fetch_add(1, Ordering::SeqCst);
        LiveWorker {
            shared: self.clone(),
        }
    }
}

/// Counts one dispatched request until dropped.
struct Outstanding {
    shared: Arc<Shared>,
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        let previous = self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "outstanding request count underflow");
        if previous == 1 && self.shared.is_stopping() && self.shared.shutdown.fire() {
            log::info!("All outstanding requests drained");
        }
    }
}

/// Counts one running accept loop until dropped.
struct LiveWorker {
    shared: Arc<Shared>,
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drives accept loops over a [`Listener`] and dispatches to an
/// [`Application`].
pub struct Pump {
    listener: Arc<Listener>,
    settings: PumpSettings,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Pump {
    pub fn new(listener: Arc<Listener>, settings: PumpSettings) -> Self {
        Self {
            listener,
            settings,
            shared: Arc::new(Shared {
                stopping: AtomicBool::new(false),
                outstanding: AtomicUsize::new(0),
                live_workers: AtomicUsize::new(0),
                shutdown: ShutdownSignal::new(),
            }),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn from_config(listener: Arc<Listener>, config: &ServerConfig) -> Self {
        Self::new(listener, PumpSettings::from(config))
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    /// Requests dispatched and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Accept loops still running.
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Starts the listener and spawns the accept loops on the current tokio
    /// runtime. Returns without waiting for any request.
    ///
    /// # Errors
    /// - Returns `Error::AlreadyStarted` on a second call
    /// - Returns `Error::Runtime` outside a tokio runtime
    /// - Returns the listener's error if it fails to start
    pub fn start<A: Application>(&self, application: A) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let runtime = Handle::try_current()?;
        self.listener.start()?;

        let application = Arc::new(application);
        let executor = Executor::new(
            Some(self.settings.max_dispatch_threads),
            Some(self.settings.dispatch_keep_alive),
            Some(runtime.clone()),
        );
        let count = self.settings.max_accepts.max(1);
        log::info!("Starting {} accept loops", count);

        let mut workers = self.workers.lock().map_err(|_| Error::LockPoisoned)?;
        for id in 0..count {
            let live = self.shared.enter_worker();
            workers.push(runtime.spawn(accept_loop(
                id,
                self.listener.clone(),
                self.shared.clone(),
                application.clone(),
                executor.clone(),
                live,
            )));
        }
        Ok(())
    }

    /// Stops dispatching and waits for outstanding requests to finish, or
    /// for `cancelled` to complete, whichever comes first.
    ///
    /// The listener keeps running; accept loops answer anything they still
    /// receive with `503`.
    pub async fn stop<C>(&self, cancelled: C) -> ShutdownOutcome
    where
        C: Future<Output = ()>,
    {
        if !self.shared.stopping.swap(true, Ordering::SeqCst) {
            log::info!("Stopping pump");
        }

        let outstanding = self.outstanding();
        if outstanding == 0 {
            self.shared.shutdown.fire();
            return ShutdownOutcome::Drained;
        }

        log::info!("Waiting for {} outstanding requests to drain", outstanding);
        tokio::select! {
            _ = self.shared.shutdown.wait() => {}
            _ = cancelled => {
                self.shared.shutdown.fire();
            }
        }

        match self.outstanding() {
            0 => ShutdownOutcome::Drained,
            remaining => {
                log::warn!("Drain deadline reached with {} requests still outstanding", remaining);
                ShutdownOutcome::Abandoned {
                    outstanding: remaining,
                }
            }
        }
    }

    /// [`stop`](Pump::stop) with a deadline of `timeout`.
    pub async fn stop_timeout(&self, timeout: Duration) -> ShutdownOutcome {
        self.stop(tokio::time::sleep(timeout)).await
    }

    /// Drains with the configured timeout, then disposes.
    ///
    /// # Errors
    /// Returns the listener's error if it fails to stop cleanly.
    pub async fn shutdown(&self) -> Result<ShutdownOutcome> {
        let outcome = self.stop_timeout(self.settings.shutdown_timeout).await;
        self.dispose()?;
        self.join().await;
        Ok(outcome)
    }

    /// Marks the pump stopping, fires the shutdown signal and disposes the
    /// listener, which aborts every pending accept.
    ///
    /// # Errors
    /// Returns the listener's error if it fails to stop cleanly.
    pub fn dispose(&self) -> Result<()> {
        self.shared.stopping.store(true, Ordering::SeqCst);
        if self.shared.shutdown.fire() {
            log::debug!("Shutdown signalled by dispose");
        }
        self.listener.dispose()
    }

    /// Waits for every accept loop to exit.
    pub async fn join(&self) {
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(err) = worker.await {
                log::error!("Accept loop ended abnormally: {}", err);
            }
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            log::error!("Error disposing pump: {}", err);
        }
    }
}

async fn accept_loop<A: Application>(
    id: usize,
    listener: Arc<Listener>,
    shared: Arc<Shared>,
    application: Arc<A>,
    executor: Executor,
    _live: LiveWorker,
) {
    let mut context = AcceptContext::new(&listener);

    while !shared.is_stopping() {
        let mut request = match listener.accept_listening(&mut context).await {
            Ok(request) => request,
            Err(err) => {
                if shared.is_stopping() {
                    log::debug!("Accept loop {} stopping: {}", id, err);
                    break;
                }
                if err.is_closed() || !listener.is_listening() {
                    log::debug!("Accept loop {} exiting, listener closed: {}", id, err);
                    break;
                }
                log::error!("Accept loop {} failed to accept a request: {}", id, err);
                // inline failures never suspend
                tokio::task::yield_now().await;
                continue;
            }
        };

        if !listener.validate_request(&mut request) {
            continue;
        }

        // counted before the stopping check so a concurrent stop waits for it
        let outstanding = shared.begin_request();
        if shared.is_stopping() {
            log::debug!("Rejecting request {} received while stopping", request.request_id());
            request.reject(StatusCode::SERVICE_UNAVAILABLE, &[]);
            drop(outstanding);
            break;
        }

        if let Err(err) = executor.spawn(dispatch(application.clone(), request, outstanding)) {
            log::error!("Failed to dispatch request: {}", err);
        }
    }

    log::debug!("Accept loop {} exited", id);
}

/// Runs one request through the application and makes sure it is answered.
async fn dispatch<A: Application>(application: Arc<A>, mut request: RequestContext, _outstanding: Outstanding) {
    let request_id = request.request_id();
    log::debug!("Dispatching request {}", request_id);

    let mut context = application.create_context(&request);
    let processed = AssertUnwindSafe(application.process_request(&mut context, &mut request))
        .catch_unwind()
        .await;

    let error: Option<BoxError> = match processed {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(panic) => Some(panic_message(panic).into()),
    };

    if !request.is_completed() {
        let status = match &error {
            None => StatusCode::OK,
            Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if let Err(err) = request.respond_status(status) {
            log::warn!("Failed to complete request {}: {}", request_id, err);
        }
    }
    if let Some(err) = &error {
        log::error!("Request {} failed: {}", request_id, err);
    }

    application.dispose_context(context, error.as_ref());
    request.release();
    log::debug!("Released request {}", request_id);
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => format!("application panicked: {}", message),
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => format!("application panicked: {}", message),
            Err(_) => "application panicked".to_owned(),
        },
    }
}
