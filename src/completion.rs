//! A reusable single-consumer completion slot.
//!
//! [`CompletionSource`] hands the outcome of one operation from whichever
//! thread finishes it to the one task waiting on it. It is reset and reused
//! for every operation, so nothing is allocated per accept.
//!
//! Every operation goes through `reset` -> exactly one `resolve`/`reject` ->
//! one `wait`. Anything else is a usage error and is reported as a
//! [`CompletionError`], never ignored. The producer may finish on the same
//! call stack that started the operation, before anyone waits.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::error::CompletionError;

/// Identifies one reset of a [`CompletionSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(u64);

enum Slot<T, E> {
    /// Never reset.
    Idle,
    /// Reset and waiting for the producer; holds the consumer's waker.
    Armed(Option<Waker>),
    Completed(Result<T, E>),
    /// The consumer took the outcome.
    Consumed,
}

struct State<T, E> {
    version: u64,
    slot: Slot<T, E>,
}

pub struct CompletionSource<T, E> {
    state: Mutex<State<T, E>>,
}

impl<T, E> CompletionSource<T, E> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                version: 0,
                slot: Slot::Idle,
            }),
        }
    }

    /// Clears any previous outcome and arms the slot for one new completion.
    pub fn reset(&self) -> Token {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.version += 1;
        state.slot = Slot::Armed(None);
        Token(state.version)
    }

    pub fn resolve(&self, value: T) -> Result<(), CompletionError> {
        self.complete(Ok(value))
    }

    pub fn reject(&self, error: E) -> Result<(), CompletionError> {
        self.complete(Err(error))
    }

    /// Whether an outcome is stored and not yet taken.
    pub fn is_completed(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(state.slot, Slot::Completed(_))
    }

    fn complete(&self, outcome: Result<T, E>) -> Result<(), CompletionError> {
        let waker = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut state.slot, Slot::Completed(outcome)) {
                Slot::Armed(waker) => waker,
                previous => {
                    let misuse = match previous {
                        Slot::Idle => CompletionError::NotReset,
                        _ => CompletionError::AlreadyCompleted,
                    };
                    // put back whatever was there, the new outcome is refused
                    state.slot = previous;
                    return Err(misuse);
                }
            }
        };

        // wake outside the lock, the consumer may poll on this very thread
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Waits for the outcome of the operation started by the reset that
    /// returned `token`.
    pub fn wait(&self, token: Token) -> Wait<'_, T, E> {
        Wait {
            source: self,
            token,
        }
    }

    fn poll_outcome(&self, token: Token, cx: &Context<'_>) -> Poll<Result<Result<T, E>, CompletionError>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.version != token.0 {
            return Poll::Ready(Err(CompletionError::StaleToken));
        }

        match std::mem::replace(&mut state.slot, Slot::Consumed) {
            Slot::Completed(outcome) => Poll::Ready(Ok(outcome)),
            Slot::Armed(waker) => {
                let waker = match waker {
                    Some(existing) if existing.will_wake(cx.waker()) => existing,
                    _ => cx.waker().clone(),
                };
                state.slot = Slot::Armed(Some(waker));
                Poll::Pending
            }
            Slot::Idle => {
                state.slot = Slot::Idle;
                Poll::Ready(Err(CompletionError::NotReset))
            }
            Slot::Consumed => Poll::Ready(Err(CompletionError::AlreadyConsumed)),
        }
    }
}

impl<T, E> Default for CompletionSource<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`CompletionSource::wait`].
pub struct Wait<'a, T, E> {
    source: &'a CompletionSource<T, E>,
    token: Token,
}

impl<T, E> Future for Wait<'_, T, E>
where
    E: From<CompletionError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.source.poll_outcome(self.token, cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(misuse)) => Poll::Ready(Err(E::from(misuse))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::time::Duration;

    type Source = CompletionSource<u32, CompletionError>;

    /// Tests that an outcome produced before anyone waits is observed on the
    /// first poll, without a wakeup.
    #[test]
    fn test_synchronous_completion() {
        let source = Source::new();
        let token = source.reset();
        source.resolve(7).unwrap();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut wait = source.wait(token);
        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Ready(Ok(7)));
    }

    /// Tests that a completion from another thread wakes the waiting task.
    #[test]
    fn test_cross_thread_completion() {
        let source = Arc::new(Source::new());
        let token = source.reset();

        let producer = source.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            producer.resolve(42).unwrap();
        });

        let value = futures::executor::block_on(source.wait(token));
        assert_eq!(value, Ok(42));
    }

    /// Tests that the slot is reusable across many operations.
    #[test]
    fn test_reuse_across_operations() {
        let source = Source::new();
        for i in 0..100 {
            let token = source.reset();
            if i % 2 == 0 {
                source.resolve(i).unwrap();
                assert_eq!(futures::executor::block_on(source.wait(token)), Ok(i));
            } else {
                source.reject(CompletionError::StaleToken).unwrap();
                assert_eq!(
                    futures::executor::block_on(source.wait(token)),
                    Err(CompletionError::StaleToken)
                );
            }
        }
    }

    #[test]
    fn test_resolve_without_reset() {
        let source = Source::new();
        assert_eq!(source.resolve(1), Err(CompletionError::NotReset));
        assert_eq!(source.reject(CompletionError::StaleToken), Err(CompletionError::NotReset));
    }

    #[test]
    fn test_double_completion() {
        let source = Source::new();
        source.reset();
        source.resolve(1).unwrap();
        assert_eq!(source.resolve(2), Err(CompletionError::AlreadyCompleted));
        assert_eq!(
            source.reject(CompletionError::NotReset),
            Err(CompletionError::AlreadyCompleted)
        );
    }

    #[test]
    fn test_stale_token() {
        let source = Source::new();
        let old = source.reset();
        let _new = source.reset();
        assert_eq!(
            futures::executor::block_on(source.wait(old)),
            Err(CompletionError::StaleToken)
        );
    }

    /// Tests that random interleavings of reset/resolve/reject never let a
    /// completion through unless the slot was freshly reset.
    #[test]
    fn test_random_misuse_is_always_caught() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..500 {
            let source = Source::new();
            // tracks whether the next completion is legal
            let mut armed = false;

            for _ in 0..rng.gen_range(1..40) {
                match rng.gen_range(0..3) {
                    0 => {
                        source.reset();
                        armed = true;
                    }
                    op => {
                        let result = if op == 1 {
                            source.resolve(rng.gen())
                        } else {
                            source.reject(CompletionError::NotReset)
                        };
                        if armed {
                            assert_eq!(result, Ok(()));
                            armed = false;
                        } else {
                            assert!(result.is_err(), "completion accepted without a fresh reset");
                        }
                    }
                }
            }
        }
    }
}
