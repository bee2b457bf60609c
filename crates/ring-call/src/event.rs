//! Internal events consumed by the per-call event loop.

use crate::dispatcher::DispatchOutcome;
use crate::error::CallResult;
use crate::timer::TimerToken;
use tokio::sync::mpsc;

/// Everything the call loop reacts to besides recognition results and user commands.
#[derive(Debug)]
pub enum CallEvent {
    /// The accumulator's quiet period elapsed.
    DebounceElapsed(TimerToken),
    /// The recognition engine restart delay elapsed.
    RestartRecognizer(TimerToken),
    /// A user-to-assistant exchange resolved (success, failure or timeout).
    Exchange(DispatchOutcome),
    /// An assistant clip finished playing (or failed to).
    PlaybackFinished { playback: u64, result: CallResult<()> },
}

/// Sends a completion event exactly once: either the real one through
/// [`CompletionGuard::complete`], or `on_drop` if the task is aborted or panics.
pub(crate) struct CompletionGuard {
    tx: mpsc::UnboundedSender<CallEvent>,
    on_drop: Option<CallEvent>,
}

impl CompletionGuard {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CallEvent>, on_drop: CallEvent) -> Self {
        Self {
            tx,
            on_drop: Some(on_drop),
        }
    }

    pub(crate) fn complete(mut self, event: CallEvent) {
        self.on_drop = None;
        let _ = self.tx.send(event);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(event) = self.on_drop.take() {
            let _ = self.tx.send(event);
        }
    }
}
