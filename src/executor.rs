use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake};
use std::thread::{self, Thread};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;

use crate::error::{ExecutorError, ExecutorResult};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Blocks a thread until a wake signal is received.
/// Dispatch threads use it to drive one application future at a time.
pub struct Parker {
    thread: Thread,
    parked: AtomicBool,
}

impl Parker {
    /// Creates a new Parker for the current thread.
    ///
    /// The parker starts in a parked state to ensure any wakeups that occur
    /// between polling and parking are not missed.
    pub fn new() -> Arc<Self> {
        Arc::new(Parker {
            thread: thread::current(),
            // start off as parked to ensure wakeups are seen in between polling and parking
            parked: AtomicBool::new(true),
        })
    }

    pub fn block_on<F: Future>(self: &Arc<Self>, fut: F) -> F::Output {
        self.parked.store(true, Ordering::Relaxed);

        let waker = self.clone().into();
        let mut cx = Context::from_waker(&waker);

        let mut fut = std::pin::pin!(fut);
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(res) => break res,
                Poll::Pending => {
                    while self.parked.swap(true, Ordering::Acquire) {
                        thread::park();
                    }
                }
            }
        }
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        if self.parked.swap(false, Ordering::Release) {
            self.thread.unpark();
        }
    }
}

/// The dispatch pool application work runs on.
///
/// - Grows on demand up to a maximum number of threads
/// - Threads exit after a period without work
/// - Each thread enters the tokio runtime it was created with, so
///   application futures can use tokio timers and I/O
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

/// State shared between the executor and its threads
struct Inner {
    /// Duration a thread waits for new work before exiting
    keep_alive: Duration,
    shared: Mutex<Shared>,
    max_workers: usize,
    condvar: Condvar,
    runtime: Option<Handle>,
}

struct Shared {
    queue: VecDeque<Task>,
    /// Current number of threads
    workers: usize,
    /// Threads waiting for work
    idle: usize,
    /// Idle threads that have been handed work
    notified: usize,
}

impl Executor {
    /// Creates a new executor.
    ///
    /// # Arguments
    /// * `max_workers` - Optional maximum number of threads. Defaults to 15 * CPU cores
    /// * `keep_alive` - Optional duration threads wait for new work. Defaults to 6 seconds
    /// * `runtime` - Optional tokio runtime entered by every thread
    pub fn new(max_workers: Option<usize>, keep_alive: Option<Duration>, runtime: Option<Handle>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    notified: 0,
                }),
                condvar: Condvar::new(),
                keep_alive: keep_alive.unwrap_or_else(|| Duration::from_secs(6)),
                max_workers: max_workers.unwrap_or_else(|| num_cpus::get() * 15).max(1),
                runtime,
            }),
        }
    }

    /// Queues `fut` to run on the pool.
    ///
    /// Wakes an idle thread or starts a new one when below the maximum;
    /// otherwise the future waits for a busy thread to finish.
    ///
    /// # Errors
    /// Returns an error if the pool state is poisoned or a thread cannot be
    /// spawned. The future is dropped in that case.
    pub fn spawn<F>(&self, fut: F) -> ExecutorResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shared = self
            .inner
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        shared.queue.push_back(Box::pin(fut));

        if shared.idle == 0 && shared.workers < self.inner.max_workers {
            shared.workers += 1;
            if let Err(err) = self.spawn_worker() {
                shared.workers -= 1;
                shared.queue.pop_back();
                return Err(err);
            }
        } else if shared.idle > 0 {
            shared.idle -= 1;
            shared.notified += 1;
            self.inner.condvar.notify_one();
        }
        Ok(())
    }

    /// Number of live threads.
    pub fn workers(&self) -> usize {
        self.inner
            .shared
            .lock()
            .map(|shared| shared.workers)
            .unwrap_or(0)
    }

    fn spawn_worker(&self) -> ExecutorResult<()> {
        let inner = self.inner.clone();
        thread::Builder::new()
            .name("kaccept-dispatch".to_owned())
            .spawn(move || {
                let _runtime = inner.runtime.as_ref().map(Handle::enter);
                if let Err(e) = inner.run() {
                    log::error!("Dispatch thread error: {}", e);
                }
            })
            .map_err(ExecutorError::ThreadSpawn)?;
        Ok(())
    }
}

impl Inner {
    /// Thread loop.
    ///
    /// The thread will:
    /// 1. Run every queued task
    /// 2. Wait for new tasks on the condition variable
    /// 3. Exit if no task arrives within the keep-alive duration
    ///
    /// # Errors
    /// Returns an error if mutex operations fail
    fn run(&self) -> ExecutorResult<()> {
        let parker = Parker::new();
        let mut shared = self.shared.lock().map_err(|_| ExecutorError::LockPoisoned)?;

        'alive: loop {
            while let Some(task) = shared.queue.pop_front() {
                drop(shared);
                if parker.block_on(AssertUnwindSafe(task).catch_unwind()).is_err() {
                    log::error!("Dispatched task panicked");
                }
                shared = self.shared.lock().map_err(|_| ExecutorError::LockPoisoned)?;
            }

            shared.idle += 1;

            loop {
                let (guard, timeout) = self
                    .condvar
                    .wait_timeout(shared, self.keep_alive)
                    .map_err(|_| ExecutorError::LockPoisoned)?;
                shared = guard;

                if shared.notified != 0 {
                    shared.notified -= 1;
                    continue 'alive;
                }

                if timeout.timed_out() {
                    break 'alive;
                }
            }
        }

        shared.workers -= 1;
        shared.idle -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    /// Tests that an executor is created with the configured limits.
    #[test]
    fn test_executor_creation() {
        let executor = Executor::new(Some(4), Some(Duration::from_secs(10)), None);
        assert_eq!(executor.inner.max_workers, 4);
        assert_eq!(executor.inner.keep_alive, Duration::from_secs(10));
        assert_eq!(executor.workers(), 0);
    }

    /// Tests that queued tasks run and the pool stays within its limit.
    #[test]
    fn test_task_execution() {
        let executor = Executor::new(Some(2), None, None);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..10 {
            let counter = counter.clone();
            let tx = tx.clone();
            executor
                .spawn(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tx.send(()).unwrap();
                })
                .unwrap();
        }

        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(2)).expect("task execution timed out");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(executor.workers() <= 2);
    }

    /// Tests that a panicking task does not take its thread down.
    #[test]
    fn test_panicking_task_keeps_worker() {
        let executor = Executor::new(Some(1), None, None);
        let (tx, rx) = mpsc::channel();

        executor.spawn(async { panic!("boom") }).unwrap();
        executor.spawn(async move { tx.send(7).unwrap() }).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(7));
        assert_eq!(executor.workers(), 1);
    }

    /// Tests that threads can use tokio timers when given a runtime handle.
    #[test]
    fn test_tasks_enter_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = Executor::new(Some(1), None, Some(runtime.handle().clone()));
        let (tx, rx) = mpsc::channel();

        executor
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                tx.send("slept").unwrap();
            })
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("slept"));
    }

    /// Tests that idle threads exit after the keep-alive.
    #[test]
    fn test_idle_workers_exit() {
        let executor = Executor::new(Some(1), Some(Duration::from_millis(50)), None);
        let (tx, rx) = mpsc::channel();
        executor.spawn(async move { tx.send(()).unwrap() }).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(executor.workers(), 0);
    }

    /// Tests the Parker waking a blocked thread from another thread.
    #[test]
    fn test_parker() {
        let parker = Parker::new();
        let parker_clone = parker.clone();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            parker_clone.wake();
        });

        let result = parker.block_on(async { "completed" });
        assert_eq!(result, "completed");
    }
}
