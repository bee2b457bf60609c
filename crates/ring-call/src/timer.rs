//! Cancellable one-shot timers delivered as events on the call's event channel.
//!
//! A timer holds at most one pending firing. Rescheduling or cancelling aborts
//! the sleeping task, but an event can already be sitting in the channel when
//! that happens, so every firing carries a [`TimerToken`] and the owner only
//! acts on it if [`Timer::accept`] says it is still the current one.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Identifies one scheduling of a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Single-slot cancellable timer. Must be used inside a tokio runtime.
pub struct Timer<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Timer<T> {
    pub fn new(name: &'static str, tx: mpsc::UnboundedSender<T>) -> Self {
        Self {
            name,
            tx,
            generation: 0,
            pending: None,
        }
    }

    /// Schedule `event` after `delay`, replacing any pending firing.
    pub fn schedule<F>(&mut self, delay: Duration, event: F) -> TimerToken
    where
        F: FnOnce(TimerToken) -> T + Send + 'static,
    {
        self.abort_pending();
        self.generation += 1;
        let token = TimerToken(self.generation);
        let tx = self.tx.clone();
        trace!(timer = self.name, ?delay, "timer scheduled");
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event(token));
        }));
        token
    }

    /// Cancel the pending firing, if any. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if self.pending.is_some() {
            trace!(timer = self.name, "timer cancelled");
        }
        self.abort_pending();
    }

    /// Consume a firing. Returns false for stale tokens (cancelled or rescheduled since).
    pub fn accept(&mut self, token: TimerToken) -> bool {
        if self.pending.is_some() && token.0 == self.generation {
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn abort_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl<T> Drop for Timer<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}
