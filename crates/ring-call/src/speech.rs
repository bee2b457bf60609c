//! **Speech-state coordination** — who holds the floor, and the microphone lifecycle.
//!
//! [`SpeechCoordinatorState`] is the shared flag set every component checks
//! before acting: the prospect is speaking, or an exchange is in flight. The
//! [`SpeechCoordinator`] owns the recognizer exclusively and restarts it when it
//! dies, but never while the prospect holds the floor.

use crate::accumulator::TranscriptAccumulator;
use crate::config::ListeningConfig;
use crate::error::CallResult;
use crate::event::CallEvent;
use crate::recognizer::{RecognitionEvent, SpeechRecognizer};
use crate::timer::{Timer, TimerToken};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Flags shared by the accumulator, dispatcher and coordinator of one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeechCoordinatorState {
    ai_speaking: bool,
    in_flight: bool,
}

impl SpeechCoordinatorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prospect audio is playing.
    pub fn ai_speaking(&self) -> bool {
        self.ai_speaking
    }

    /// A user turn is awaiting its reply.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// The user cannot take a turn right now.
    pub fn floor_taken(&self) -> bool {
        self.ai_speaking || self.in_flight
    }

    pub(crate) fn set_ai_speaking(&mut self, speaking: bool) {
        self.ai_speaking = speaking;
    }

    pub(crate) fn set_in_flight(&mut self, in_flight: bool) {
        self.in_flight = in_flight;
    }
}

/// Owns the speech recognizer for the lifetime of the call.
pub struct SpeechCoordinator {
    recognizer: Box<dyn SpeechRecognizer>,
    recognition_tx: mpsc::UnboundedSender<RecognitionEvent>,
    listening: bool,
    engine_running: bool,
    /// The engine died while the prospect was speaking.
    restart_pending: bool,
    restart_timer: Timer<CallEvent>,
    restart_delay: Duration,
    max_restart_delay: Duration,
    max_restart_failures: u32,
    /// Restarts in a row whose `start` failed; doubles the delay each time.
    failed_restarts: u32,
    restarts: usize,
}

impl SpeechCoordinator {
    /// Returns the coordinator and the receiving end of the recognition channel.
    /// The coordinator keeps a sender, so the channel stays open across engine restarts.
    pub fn new(
        recognizer: Box<dyn SpeechRecognizer>,
        config: &ListeningConfig,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<RecognitionEvent>) {
        let (recognition_tx, recognition_rx) = mpsc::unbounded_channel();
        (
            Self {
                recognizer,
                recognition_tx,
                listening: false,
                engine_running: false,
                restart_pending: false,
                restart_timer: Timer::new("recognizer-restart", events),
                restart_delay: config.restart_delay(),
                max_restart_delay: config.max_restart_delay(),
                max_restart_failures: config.max_restart_failures,
                failed_restarts: 0,
                restarts: 0,
            },
            recognition_rx,
        )
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Automatic restarts performed so far.
    pub fn restart_count(&self) -> usize {
        self.restarts
    }

    /// Restarts have failed too many times in a row to keep trying.
    pub fn restarts_exhausted(&self) -> bool {
        self.max_restart_failures > 0 && self.failed_restarts >= self.max_restart_failures
    }

    /// Delay before the next restart: the base delay, doubled per failed restart, capped.
    pub fn next_restart_delay(&self) -> Duration {
        let factor = 1u32 << self.failed_restarts.min(16);
        self.restart_delay
            .saturating_mul(factor)
            .min(self.max_restart_delay)
    }

    /// Open the microphone. No-op when already listening.
    pub async fn start_listening(&mut self) -> CallResult<()> {
        if self.listening {
            return Ok(());
        }
        self.recognizer.start(self.recognition_tx.clone()).await?;
        self.listening = true;
        self.engine_running = true;
        self.restart_pending = false;
        self.failed_restarts = 0;
        info!("listening started");
        Ok(())
    }

    /// Close the microphone and cancel any scheduled restart. Idempotent.
    pub async fn stop_listening(&mut self) {
        self.restart_timer.cancel();
        self.restart_pending = false;
        if !self.listening {
            return;
        }
        self.listening = false;
        self.engine_running = false;
        self.recognizer.stop().await;
        info!("listening stopped");
    }

    /// Record a floor change. Going silent flushes what the user said meanwhile
    /// and brings back an engine that died during playback.
    pub fn set_ai_speaking(
        &mut self,
        speaking: bool,
        state: &mut SpeechCoordinatorState,
        accumulator: &mut TranscriptAccumulator,
    ) -> Option<String> {
        if state.ai_speaking() == speaking {
            return None;
        }
        state.set_ai_speaking(speaking);

        if speaking {
            accumulator.cancel_debounce();
            if self.restart_timer.is_pending() {
                self.restart_timer.cancel();
                self.restart_pending = true;
            }
            return None;
        }

        if self.restart_pending && self.listening {
            debug!("prospect finished speaking; restarting deferred recognizer");
            self.schedule_restart();
        }
        accumulator.flush()
    }

    /// The engine stopped on its own.
    pub fn on_engine_terminated(&mut self, reason: &str, state: &SpeechCoordinatorState) {
        if !self.listening {
            return;
        }
        self.engine_running = false;
        if state.ai_speaking() {
            debug!(reason, "recognizer terminated while prospect speaks; restart deferred");
            self.restart_pending = true;
            return;
        }
        if self.restart_timer.is_pending() {
            return;
        }
        debug!(reason, delay = ?self.next_restart_delay(), "recognizer terminated; scheduling restart");
        self.schedule_restart();
    }

    /// The restart delay elapsed. Errors come from the recognizer's `start`; a
    /// failed start counts towards [`Self::restarts_exhausted`].
    pub async fn on_restart_elapsed(
        &mut self,
        token: TimerToken,
        state: &SpeechCoordinatorState,
    ) -> CallResult<()> {
        if !self.restart_timer.accept(token) || !self.listening || self.engine_running {
            return Ok(());
        }
        if state.ai_speaking() {
            self.restart_pending = true;
            return Ok(());
        }
        self.restarts += 1;
        self.restart_pending = false;
        info!(restarts = self.restarts, "restarting recognizer");
        if let Err(e) = self.recognizer.start(self.recognition_tx.clone()).await {
            self.failed_restarts += 1;
            return Err(e);
        }
        self.failed_restarts = 0;
        self.engine_running = true;
        Ok(())
    }

    fn schedule_restart(&mut self) {
        self.restart_pending = false;
        let delay = self.next_restart_delay();
        self.restart_timer.schedule(delay, CallEvent::RestartRecognizer);
    }
}
