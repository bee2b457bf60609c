//! **Call lifecycle** — `Dialing → Ringing → Connected → Ended`.
//!
//! One spawned task per call owns every component and reacts to three sources:
//! internal [`CallEvent`]s (timers, exchange outcomes, playback completion),
//! [`RecognitionEvent`]s from the microphone, and commands from the
//! [`CallHandle`]. Nothing is shared across tasks except through channels.

use crate::accumulator::TranscriptAccumulator;
use crate::config::CallConfig;
use crate::dispatcher::{DispatchOutcome, SubmitDecision, TurnDispatcher};
use crate::error::{CallError, CallResult};
use crate::event::{CallEvent, CompletionGuard};
use crate::generation::{Reply, ReplyGenerator};
use crate::persona::TrainingConfig;
use crate::playback::AudioPlayer;
use crate::recognizer::{RecognitionEvent, SpeechRecognizer, TransportState};
use crate::scoring::{fallback_score, CallScorer, ScoreReport};
use crate::speech::{SpeechCoordinator, SpeechCoordinatorState};
use crate::transcript::{Transcript, Turn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Lifecycle of one call. Ordered: a call only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Dialing,
    Ringing,
    Connected,
    Ended,
}

impl CallState {
    /// Next step in line, or `Ended` from anywhere but `Ended`.
    pub fn can_transition_to(self, next: CallState) -> bool {
        matches!(
            (self, next),
            (CallState::Dialing, CallState::Ringing)
                | (CallState::Ringing, CallState::Connected)
                | (CallState::Dialing | CallState::Ringing | CallState::Connected, CallState::Ended)
        )
    }
}

/// One entry of the call's state log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStateTransition {
    pub from: CallState,
    pub to: CallState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Why the call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The trainee hung up (or dropped the handle).
    UserHangUp,
    /// The prospect's reply asked to end the call.
    ProspectHungUp,
    /// Reply generation kept failing.
    GenerationUnavailable,
    /// Microphone, audio output or transport failure.
    Fault,
}

impl EndReason {
    fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserHangUp => "user hung up",
            EndReason::ProspectHungUp => "prospect hung up",
            EndReason::GenerationUnavailable => "reply generation unavailable",
            EndReason::Fault => "fault",
        }
    }
}

/// Everything the surrounding application gets back once a call is over.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub session_id: Uuid,
    pub training: TrainingConfig,
    pub score: u8,
    /// Strengths.
    pub feedback: Vec<String>,
    pub recommendations: Vec<String>,
    pub improvements: Vec<String>,
    pub detailed_breakdown: BTreeMap<String, u8>,
    /// Time spent `Connected`.
    pub duration: Duration,
    pub transcript: Transcript,
    pub transitions: Vec<CallStateTransition>,
    pub end_reason: EndReason,
    /// The score comes from the local fallback, not the scoring collaborator.
    pub scored_by_fallback: bool,
    /// What went wrong, when the call ended on a failure.
    pub error: Option<String>,
    /// Actionable message for the trainee, when there is one.
    pub user_message: Option<String>,
}

impl SessionResult {
    pub fn duration_secs(&self) -> u64 {
        self.duration.as_secs()
    }

    /// States entered, in order, starting with `Dialing`.
    pub fn states(&self) -> Vec<CallState> {
        std::iter::once(CallState::Dialing)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }
}

/// External capabilities a call runs against.
pub struct CallCollaborators {
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub scorer: Arc<dyn CallScorer>,
    pub player: Arc<dyn AudioPlayer>,
}

enum CallCommand {
    HangUp,
    Fault(CallError),
}

/// Control side of a running call.
pub struct CallHandle {
    session_id: Uuid,
    commands: mpsc::UnboundedSender<CallCommand>,
    state: watch::Receiver<CallState>,
    task: JoinHandle<SessionResult>,
}

impl CallHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// End the call from the trainee's side.
    pub fn hang_up(&self) -> CallResult<()> {
        self.commands
            .send(CallCommand::HangUp)
            .map_err(|_| CallError::CallEnded)
    }

    /// Report a failure detected outside the engine (e.g. the UI lost the
    /// microphone). Fatal errors end the call; others are logged.
    pub fn report_fault(&self, error: CallError) -> CallResult<()> {
        self.commands
            .send(CallCommand::Fault(error))
            .map_err(|_| CallError::CallEnded)
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Wait until the call has reached `target` (or gone past it).
    pub async fn wait_for_state(&mut self, target: CallState) -> CallResult<CallState> {
        loop {
            let current = *self.state.borrow_and_update();
            if current >= target {
                return Ok(current);
            }
            if self.state.changed().await.is_err() {
                return Err(CallError::CallEnded);
            }
        }
    }

    /// Wait for the call to end and return its result. Does not hang up.
    pub async fn finish(self) -> CallResult<SessionResult> {
        let CallHandle { commands, task, .. } = self;
        let result = task.await.map_err(|e| CallError::Task(e.to_string()));
        drop(commands);
        result
    }
}

/// Entry point: place a simulated call.
pub struct PhoneCall;

impl PhoneCall {
    /// Spawn the call on the current tokio runtime and start dialing.
    pub fn start(
        training: TrainingConfig,
        config: CallConfig,
        collaborators: CallCollaborators,
    ) -> CallHandle {
        let session_id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Dialing);

        let (coordinator, recognition_rx) = SpeechCoordinator::new(
            collaborators.recognizer,
            &config.listening,
            events_tx.clone(),
        );
        let session = CallSession {
            id: session_id,
            training,
            state: CallState::Dialing,
            state_tx,
            transitions: Vec::new(),
            transcript: Transcript::new(),
            speech: SpeechCoordinatorState::new(),
            accumulator: TranscriptAccumulator::new(&config.accumulator, events_tx.clone()),
            dispatcher: TurnDispatcher::new(&config.dispatch, collaborators.generator, events_tx.clone()),
            coordinator,
            player: collaborators.player,
            scorer: collaborators.scorer,
            events_tx,
            events_rx,
            recognition_rx,
            commands_rx,
            connected_at: None,
            playback: None,
            next_playback: 0,
            config,
        };

        info!(
            session = %session_id,
            persona = %training.persona,
            difficulty = %training.difficulty,
            "📞 Dialing"
        );
        let task = tokio::spawn(session.run());
        CallHandle {
            session_id,
            commands: commands_tx,
            state: state_rx,
            task,
        }
    }
}

struct Playback {
    id: u64,
    end_after: Option<EndReason>,
    task: JoinHandle<()>,
}

enum Flow {
    Continue,
    End(EndReason, Option<CallError>),
}

enum RingOutcome {
    Answered(Reply),
    Ended(EndReason, Option<CallError>),
}

struct CallSession {
    id: Uuid,
    training: TrainingConfig,
    config: CallConfig,
    state: CallState,
    state_tx: watch::Sender<CallState>,
    transitions: Vec<CallStateTransition>,
    transcript: Transcript,
    speech: SpeechCoordinatorState,
    accumulator: TranscriptAccumulator,
    dispatcher: TurnDispatcher,
    coordinator: SpeechCoordinator,
    player: Arc<dyn AudioPlayer>,
    scorer: Arc<dyn CallScorer>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    events_rx: mpsc::UnboundedReceiver<CallEvent>,
    recognition_rx: mpsc::UnboundedReceiver<RecognitionEvent>,
    commands_rx: mpsc::UnboundedReceiver<CallCommand>,
    connected_at: Option<Instant>,
    playback: Option<Playback>,
    next_playback: u64,
}

impl CallSession {
    async fn run(mut self) -> SessionResult {
        let opening = match self.ring().await {
            RingOutcome::Answered(opening) => opening,
            RingOutcome::Ended(reason, error) => return self.end(reason, error).await,
        };
        if let Flow::End(reason, error) = self.connect(opening).await {
            return self.end(reason, error).await;
        }
        let (reason, error) = self.converse().await;
        self.end(reason, error).await
    }

    /// Ringtone and opening line run side by side; the call connects when both are done.
    async fn ring(&mut self) -> RingOutcome {
        self.transition(CallState::Ringing, "ringtone started");

        let player = Arc::clone(&self.player);
        let dispatcher = &self.dispatcher;
        let commands = &mut self.commands_rx;

        let prepared = async { tokio::join!(player.play_ringtone(), dispatcher.opening_line()) };
        tokio::pin!(prepared);

        loop {
            tokio::select! {
                (ringtone, opening) = &mut prepared => {
                    if let Err(e) = ringtone {
                        if e.is_fatal() {
                            return RingOutcome::Ended(EndReason::Fault, Some(e));
                        }
                        warn!(error = %e, "ringtone failed");
                    }
                    return RingOutcome::Answered(opening);
                }
                command = commands.recv() => match command {
                    Some(CallCommand::HangUp) | None => {
                        return RingOutcome::Ended(EndReason::UserHangUp, None);
                    }
                    Some(CallCommand::Fault(e)) if e.is_fatal() => {
                        return RingOutcome::Ended(EndReason::Fault, Some(e));
                    }
                    Some(CallCommand::Fault(e)) => warn!(error = %e, "non-fatal fault while ringing"),
                },
            }
        }
    }

    async fn connect(&mut self, opening: Reply) -> Flow {
        self.transition(CallState::Connected, "opening line ready");
        self.connected_at = Some(Instant::now());

        if let Some(turn) = Turn::assistant(opening.message.as_str()) {
            self.transcript.append(turn);
        }
        if self.config.listening.capture_during_opening {
            if let Err(e) = self.coordinator.start_listening().await {
                if e.is_fatal() {
                    return Flow::End(EndReason::Fault, Some(e));
                }
                warn!(error = %e, "could not open the microphone; retrying after the opening line");
            }
        }
        let end_after = opening.should_end_call.then_some(EndReason::ProspectHungUp);
        self.speak(opening, end_after);
        Flow::Continue
    }

    async fn converse(&mut self) -> (EndReason, Option<CallError>) {
        loop {
            let flow = tokio::select! {
                Some(event) = self.events_rx.recv() => self.on_call_event(event).await,
                Some(event) = self.recognition_rx.recv() => self.on_recognition_event(event),
                command = self.commands_rx.recv() => self.on_command(command),
            };
            if let Flow::End(reason, error) = flow {
                return (reason, error);
            }
        }
    }

    async fn on_call_event(&mut self, event: CallEvent) -> Flow {
        match event {
            CallEvent::DebounceElapsed(token) => {
                if let Some(text) = self.accumulator.on_debounce_elapsed(token, &self.speech) {
                    self.submit(text);
                }
                Flow::Continue
            }
            CallEvent::RestartRecognizer(token) => {
                match self.coordinator.on_restart_elapsed(token, &self.speech).await {
                    Ok(()) => Flow::Continue,
                    Err(e) if e.is_fatal() => Flow::End(EndReason::Fault, Some(e)),
                    Err(e) if self.coordinator.restarts_exhausted() => {
                        error!(error = %e, "recognizer keeps failing to restart; ending call");
                        Flow::End(EndReason::Fault, Some(e))
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_in = ?self.coordinator.next_restart_delay(),
                            "recognizer restart failed; backing off"
                        );
                        self.coordinator
                            .on_engine_terminated(&e.to_string(), &self.speech);
                        Flow::Continue
                    }
                }
            }
            CallEvent::Exchange(outcome) => {
                self.on_exchange(outcome);
                Flow::Continue
            }
            CallEvent::PlaybackFinished { playback, result } => {
                self.on_playback_finished(playback, result).await
            }
        }
    }

    fn on_recognition_event(&mut self, event: RecognitionEvent) -> Flow {
        if !self.coordinator.is_listening() {
            trace!(?event, "recognition event while not listening ignored");
            return Flow::Continue;
        }
        match event {
            RecognitionEvent::Result {
                final_text,
                interim_text,
            } => {
                if let Some(text) =
                    self.accumulator
                        .on_recognition_result(&final_text, &interim_text, &self.speech)
                {
                    self.submit(text);
                }
            }
            RecognitionEvent::Terminated { reason } => {
                self.coordinator.on_engine_terminated(&reason, &self.speech);
            }
            RecognitionEvent::DeviceError { kind, detail } => {
                return Flow::End(EndReason::Fault, Some(CallError::microphone(kind, detail)));
            }
            RecognitionEvent::Transport(TransportState::Error) => {
                return Flow::End(
                    EndReason::Fault,
                    Some(CallError::Transport("real-time connection failed".to_string())),
                );
            }
            RecognitionEvent::Transport(TransportState::Disconnected) => {
                self.coordinator
                    .on_engine_terminated("transport disconnected", &self.speech);
            }
            RecognitionEvent::Transport(state) => debug!(?state, "transport state"),
        }
        Flow::Continue
    }

    fn on_command(&mut self, command: Option<CallCommand>) -> Flow {
        match command {
            Some(CallCommand::HangUp) => Flow::End(EndReason::UserHangUp, None),
            None => {
                info!("call handle dropped; hanging up");
                Flow::End(EndReason::UserHangUp, None)
            }
            Some(CallCommand::Fault(e)) if e.is_fatal() => Flow::End(EndReason::Fault, Some(e)),
            Some(CallCommand::Fault(e)) => {
                warn!(error = %e, "non-fatal fault reported; call continues");
                Flow::Continue
            }
        }
    }

    fn submit(&mut self, text: String) {
        match self
            .dispatcher
            .submit(&text, &mut self.speech, &mut self.transcript)
        {
            SubmitDecision::TooSoon { retry_after } => {
                self.accumulator.requeue(&text, Some(retry_after))
            }
            SubmitDecision::InFlight | SubmitDecision::AiSpeaking => {
                self.accumulator.requeue(&text, None)
            }
            SubmitDecision::Accepted(_)
            | SubmitDecision::Empty
            | SubmitDecision::Duplicate
            | SubmitDecision::Closed => {}
        }
    }

    fn on_exchange(&mut self, outcome: DispatchOutcome) {
        let Some(reply) = self
            .dispatcher
            .on_outcome(outcome, &mut self.speech, &mut self.transcript)
        else {
            return;
        };

        let end_after = if self.dispatcher.exhausted() {
            error!(
                failures = self.dispatcher.consecutive_failures(),
                "reply generation unavailable; ending call after the fallback"
            );
            Some(EndReason::GenerationUnavailable)
        } else if reply.should_end_call {
            Some(EndReason::ProspectHungUp)
        } else {
            None
        };
        self.speak(reply, end_after);
    }

    /// Give the floor to the prospect and play `reply` in the background.
    fn speak(&mut self, reply: Reply, end_after: Option<EndReason>) {
        self.coordinator
            .set_ai_speaking(true, &mut self.speech, &mut self.accumulator);

        let id = self.next_playback;
        self.next_playback += 1;
        let player = Arc::clone(&self.player);
        let clip = reply.audio;
        let guard = CompletionGuard::new(
            self.events_tx.clone(),
            CallEvent::PlaybackFinished {
                playback: id,
                result: Err(CallError::Playback("playback aborted".to_string())),
            },
        );
        let task = tokio::spawn(async move {
            let result = player.play(&clip).await;
            guard.complete(CallEvent::PlaybackFinished { playback: id, result });
        });
        debug!(playback = id, message = %reply.message, "🔊 prospect speaking");

        if let Some(previous) = self.playback.replace(Playback { id, end_after, task }) {
            previous.task.abort();
        }
    }

    async fn on_playback_finished(&mut self, id: u64, result: CallResult<()>) -> Flow {
        let current = match self.playback.take() {
            Some(current) if current.id == id => current,
            other => {
                self.playback = other;
                debug!(playback = id, "stale playback completion ignored");
                return Flow::Continue;
            }
        };

        if let Err(e) = result {
            if e.is_fatal() {
                return Flow::End(EndReason::Fault, Some(e));
            }
            warn!(error = %e, "playback failed; handing the floor back");
        }

        if let Some(reason) = current.end_after {
            let error = (reason == EndReason::GenerationUnavailable).then(|| {
                CallError::Generation(format!(
                    "{} consecutive failures, last: {}",
                    self.dispatcher.consecutive_failures(),
                    self.dispatcher.last_failure().unwrap_or("unknown")
                ))
            });
            return Flow::End(reason, error);
        }

        if let Some(text) = self
            .coordinator
            .set_ai_speaking(false, &mut self.speech, &mut self.accumulator)
        {
            self.submit(text);
        }

        if !self.coordinator.is_listening() {
            if let Err(e) = self.coordinator.start_listening().await {
                if e.is_fatal() {
                    return Flow::End(EndReason::Fault, Some(e));
                }
                warn!(error = %e, "could not open the microphone");
            }
        }
        Flow::Continue
    }

    fn transition(&mut self, to: CallState, reason: &str) -> bool {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!(?from, ?to, "illegal call state transition ignored");
            return false;
        }
        self.state = to;
        self.transitions.push(CallStateTransition {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.state_tx.send_replace(to);
        info!(session = %self.id, ?from, ?to, reason, "📞 call state changed");
        true
    }

    async fn end(mut self, reason: EndReason, error: Option<CallError>) -> SessionResult {
        self.transition(CallState::Ended, reason.as_str());

        self.player.stop();
        if let Some(playback) = self.playback.take() {
            playback.task.abort();
        }
        self.coordinator.stop_listening().await;
        self.accumulator.reset();
        self.dispatcher.abandon(&mut self.speech);
        self.speech.set_ai_speaking(false);
        self.transcript.freeze();

        let duration = self
            .connected_at
            .map(|at| at.elapsed())
            .unwrap_or_default();
        if let Some(e) = &error {
            error!(session = %self.id, error = %e, "call ended on failure");
        }

        let (report, scored_by_fallback) = score_session(
            self.scorer.as_ref(),
            &self.transcript,
            &self.training,
            duration,
            self.config.scoring.timeout(),
        )
        .await;
        info!(
            session = %self.id,
            score = report.score,
            turns = self.transcript.len(),
            duration_secs = duration.as_secs(),
            scored_by_fallback,
            "✅ call complete"
        );

        SessionResult {
            session_id: self.id,
            training: self.training,
            score: report.score,
            feedback: report.strengths,
            recommendations: report.recommendations,
            improvements: report.improvements,
            detailed_breakdown: report.detailed_breakdown,
            duration,
            transcript: self.transcript,
            transitions: self.transitions,
            end_reason: reason,
            scored_by_fallback,
            user_message: error
                .as_ref()
                .and_then(|e| e.user_message())
                .map(str::to_string),
            error: error.map(|e| e.to_string()),
        }
    }
}

/// Score through the collaborator, falling back to [`fallback_score`] on error or timeout.
async fn score_session(
    scorer: &dyn CallScorer,
    transcript: &Transcript,
    training: &TrainingConfig,
    duration: Duration,
    timeout: Duration,
) -> (ScoreReport, bool) {
    match tokio::time::timeout(timeout, scorer.score_call(transcript, training, duration)).await {
        Ok(Ok(mut report)) => {
            report.score = report.score.min(100);
            (report, false)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "scoring failed; using fallback score");
            (fallback_score(transcript, duration), true)
        }
        Err(_) => {
            warn!(?timeout, "scoring timed out; using fallback score");
            (fallback_score(transcript, duration), true)
        }
    }
}
