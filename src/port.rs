/// A completion port: a dedicated thread that delivers kernel notifications.
///
/// Posting a packet queues it and wakes the port thread through a
/// `mio::Waker`; the thread runs every queued packet in order. Notifications
/// therefore never run on the thread that issued the operation.
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::{Events, Poll, Token, Waker};

use crate::accept::Overlapped;
use crate::error::{PortError, PortResult};
use crate::transport::Status;

const WAKE: Token = Token(0);

type Packet = Box<dyn FnOnce() + Send>;

/// Handle to the port thread. Dropping it drains what is queued and joins
/// the thread.
pub struct CompletionPort {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// State shared with the port thread.
struct Shared {
    waker: Waker,
    packets: Mutex<VecDeque<Packet>>,
    closed: AtomicBool,
}

impl CompletionPort {
    /// Creates a port with its own notification thread.
    ///
    /// # Errors
    /// - Returns `PortError::Init` if the poller or its waker cannot be
    ///   created, or the thread cannot be spawned
    pub fn new() -> PortResult<Self> {
        let poll = Poll::new().map_err(PortError::Init)?;
        let shared = Arc::new(Shared {
            waker: Waker::new(poll.registry(), WAKE).map_err(PortError::Init)?,
            packets: Mutex::new(VecDeque::with_capacity(64)),
            closed: AtomicBool::new(false),
        });

        let thread = thread::Builder::new()
            .name("kaccept-completion".to_owned())
            .spawn({
                let shared = shared.clone();
                move || {
                    if let Err(err) = shared.run(poll) {
                        log::error!("Completion port stopped: {}", err);
                    }
                }
            })
            .map_err(PortError::Init)?;

        Ok(CompletionPort {
            shared,
            thread: Some(thread),
        })
    }

    /// Queues `packet` to run on the port thread.
    ///
    /// # Errors
    /// - Returns `PortError::Closed` once the port is shutting down
    /// - Returns `PortError::Wake` if the port thread cannot be woken
    pub fn post(&self, packet: impl FnOnce() + Send + 'static) -> PortResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PortError::Closed);
        }
        self.shared
            .packets
            .lock()
            .map_err(|_| PortError::LockPoisoned)?
            .push_back(Box::new(packet));
        self.shared.waker.wake().map_err(PortError::Wake)
    }

    /// Posts the outcome of a pending receive.
    pub fn post_completion(&self, overlapped: Overlapped, status: Status, bytes: usize) -> PortResult<()> {
        self.post(move || overlapped.complete(status, bytes))
    }

    /// Packets queued and not yet run.
    pub fn pending(&self) -> usize {
        self.shared.packets.lock().map(|packets| packets.len()).unwrap_or(0)
    }
}

impl Shared {
    /// Event loop of the port thread.
    fn run(&self, mut poll: Poll) -> PortResult<()> {
        let mut events = Events::with_capacity(8);
        loop {
            if let Err(err) = poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(PortError::Polling(err));
            }

            self.dispatch()?;
            if self.closed.load(Ordering::Acquire) {
                // packets posted before the close flag was seen
                return self.dispatch();
            }
        }
    }

    fn dispatch(&self) -> PortResult<()> {
        loop {
            let batch: Vec<Packet> = {
                let mut packets = self.packets.lock().map_err(|_| PortError::LockPoisoned)?;
                packets.drain(..).collect()
            };
            if batch.is_empty() {
                return Ok(());
            }
            for packet in batch {
                packet();
            }
        }
    }
}

impl fmt::Debug for CompletionPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionPort")
            .field("pending", &self.pending())
            .field("closed", &self.shared.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Err(err) = self.shared.waker.wake() {
            log::warn!("Failed to wake completion port for shutdown: {}", err);
        }
        if let Some(thread) = self.thread.take() {
            // the last owner may be a packet running on the port thread
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                log::error!("Completion port thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Tests that packets run in order on the port thread, not the poster's.
    #[test]
    fn test_packets_run_on_port_thread() {
        let port = CompletionPort::new().unwrap();
        let (tx, rx) = mpsc::channel();

        for i in 0..10 {
            let tx = tx.clone();
            port.post(move || {
                tx.send((i, thread::current().name().map(str::to_owned))).unwrap();
            })
            .unwrap();
        }

        for expected in 0..10 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(i, expected);
            assert_eq!(name.as_deref(), Some("kaccept-completion"));
        }
    }

    /// Tests that dropping the port still runs everything already posted.
    #[test]
    fn test_drop_drains_posted_packets() {
        let port = CompletionPort::new().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            port.post(move || tx.send(i).unwrap()).unwrap();
        }
        drop(port);

        let delivered: Vec<_> = rx.try_iter().collect();
        assert_eq!(delivered, (0..100).collect::<Vec<_>>());
    }
}
