//! **Speech recognition** — the continuous recognizer the call listens through.
//!
//! Implement [`SpeechRecognizer`] over a browser/native engine or a streaming
//! STT service. Engines push [`RecognitionEvent`]s on the channel handed to
//! `start`; the call engine decides what to do with them.

use crate::error::{CallError, CallResult, MicrophoneErrorKind};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// Connection state of a real-time transport variant (WebRTC and friends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Events delivered by a recognition engine while listening.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// Newly finalized text plus the current tentative tail (full replacement).
    Result {
        final_text: String,
        interim_text: String,
    },
    /// The engine stopped on its own (silence timeout, audio glitch, ...).
    Terminated { reason: String },
    /// The capture device failed or access was revoked.
    DeviceError {
        kind: MicrophoneErrorKind,
        detail: String,
    },
    /// Transport-level state change.
    Transport(TransportState),
}

impl RecognitionEvent {
    pub fn result(final_text: impl Into<String>, interim_text: impl Into<String>) -> Self {
        RecognitionEvent::Result {
            final_text: final_text.into(),
            interim_text: interim_text.into(),
        }
    }
}

/// Continuous speech recognizer owned by the speech coordinator.
#[async_trait]
pub trait SpeechRecognizer: Send {
    /// Begin capturing. Results flow to `events` until `stop` or the engine terminates.
    /// Device failures (permission, missing microphone) are returned as `CallError::Microphone`.
    async fn start(&mut self, events: mpsc::UnboundedSender<RecognitionEvent>) -> CallResult<()>;

    /// Stop capturing. Must tolerate being called when already stopped.
    async fn stop(&mut self);
}

#[derive(Default)]
struct ScriptedState {
    events: Option<mpsc::UnboundedSender<RecognitionEvent>>,
    starts: usize,
    stops: usize,
    attempts: usize,
    fail_next_start: Option<MicrophoneErrorKind>,
    transient_failures: usize,
}

/// Recognizer driven by hand through a [`RecognizerProbe`]. Use for tests and
/// demos without microphone hardware.
pub struct ScriptedRecognizer {
    state: Arc<Mutex<ScriptedState>>,
}

/// Test-side handle of a [`ScriptedRecognizer`]: inject speech, kill the engine, count restarts.
#[derive(Clone)]
pub struct RecognizerProbe {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedRecognizer {
    pub fn new() -> (Self, RecognizerProbe) {
        let state = Arc::new(Mutex::new(ScriptedState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            RecognizerProbe { state },
        )
    }
}

fn lock(state: &Mutex<ScriptedState>) -> MutexGuard<'_, ScriptedState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn start(&mut self, events: mpsc::UnboundedSender<RecognitionEvent>) -> CallResult<()> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        if let Some(kind) = state.fail_next_start.take() {
            return Err(CallError::microphone(kind, "scripted start failure"));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(CallError::Recognition("engine unavailable".to_string()));
        }
        state.starts += 1;
        state.events = Some(events);
        debug!(starts = state.starts, "scripted recognizer started");
        Ok(())
    }

    async fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.stops += 1;
        state.events = None;
    }
}

impl RecognizerProbe {
    /// Deliver a raw result. Returns false when the engine is not running.
    pub fn emit(&self, final_text: &str, interim_text: &str) -> bool {
        self.send(RecognitionEvent::result(final_text, interim_text))
    }

    pub fn say_final(&self, text: &str) -> bool {
        self.emit(text, "")
    }

    pub fn say_interim(&self, text: &str) -> bool {
        self.emit("", text)
    }

    /// Simulate the engine dying on its own. The channel is dropped, as a real engine would.
    pub fn terminate(&self, reason: &str) -> bool {
        let mut state = lock(&self.state);
        match state.events.take() {
            Some(tx) => tx
                .send(RecognitionEvent::Terminated {
                    reason: reason.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn device_error(&self, kind: MicrophoneErrorKind, detail: &str) -> bool {
        self.send(RecognitionEvent::DeviceError {
            kind,
            detail: detail.to_string(),
        })
    }

    pub fn transport(&self, transport: TransportState) -> bool {
        self.send(RecognitionEvent::Transport(transport))
    }

    /// The next `start` fails with a microphone error of this kind.
    pub fn fail_next_start(&self, kind: MicrophoneErrorKind) {
        lock(&self.state).fail_next_start = Some(kind);
    }

    /// The next `count` starts fail with a recoverable recognition error.
    pub fn fail_starts(&self, count: usize) {
        lock(&self.state).transient_failures = count;
    }

    /// Sender of the running engine, if any.
    pub fn sender(&self) -> Option<mpsc::UnboundedSender<RecognitionEvent>> {
        lock(&self.state).events.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).events.is_some()
    }

    pub fn start_count(&self) -> usize {
        lock(&self.state).starts
    }

    /// Calls to `start`, failed ones included.
    pub fn start_attempts(&self) -> usize {
        lock(&self.state).attempts
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stops
    }

    fn send(&self, event: RecognitionEvent) -> bool {
        match lock(&self.state).events.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}
