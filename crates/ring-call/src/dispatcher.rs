//! **Turn dispatch** — one user→prospect exchange at a time.
//!
//! `submit` either accepts a user turn (appends it, spawns the generation task)
//! or declines silently; declining is how duplicate and overlapping recognition
//! events are absorbed. The exchange task always reports back through a
//! [`DispatchOutcome`], even when aborted, so the in-flight flag is released on
//! every path.

use crate::config::{DispatchConfig, DEFAULT_FALLBACK_OPENING, DEFAULT_FALLBACK_UTTERANCE};
use crate::error::{CallError, CallResult};
use crate::event::{CallEvent, CompletionGuard};
use crate::generation::{Reply, ReplyGenerator};
use crate::speech::SpeechCoordinatorState;
use crate::transcript::{Transcript, Turn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identifies one submitted exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(u64);

/// Result of one exchange, delivered to the call loop.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub exchange: ExchangeId,
    pub result: CallResult<Reply>,
}

/// What `submit` did with a candidate turn. Everything but `Accepted` is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitDecision {
    Accepted(ExchangeId),
    Empty,
    /// Another exchange is awaiting its reply.
    InFlight,
    /// The prospect is speaking.
    AiSpeaking,
    /// Same text as the previous submission.
    Duplicate,
    /// Too close to the previous submission.
    TooSoon { retry_after: Duration },
    /// The transcript is frozen.
    Closed,
}

struct InFlight {
    exchange: ExchangeId,
    task: JoinHandle<()>,
}

pub struct TurnDispatcher {
    config: DispatchConfig,
    generator: Arc<dyn ReplyGenerator>,
    events: mpsc::UnboundedSender<CallEvent>,
    last_submitted: Option<String>,
    last_submit_at: Option<Instant>,
    in_flight: Option<InFlight>,
    next_exchange: u64,
    consecutive_failures: u32,
    last_failure: Option<String>,
}

impl TurnDispatcher {
    pub fn new(
        config: &DispatchConfig,
        generator: Arc<dyn ReplyGenerator>,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            config: config.clone(),
            generator,
            events,
            last_submitted: None,
            last_submit_at: None,
            in_flight: None,
            next_exchange: 0,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    /// Submit a completed user utterance.
    pub fn submit(
        &mut self,
        text: &str,
        state: &mut SpeechCoordinatorState,
        transcript: &mut Transcript,
    ) -> SubmitDecision {
        let decision = self.check(text.trim(), state, transcript);
        if decision != SubmitDecision::Empty {
            debug!(?decision, text, "submit");
        }
        if !matches!(decision, SubmitDecision::Accepted(_)) {
            return decision;
        }

        let text = text.trim();
        let Some(turn) = Turn::user(text) else {
            return SubmitDecision::Empty;
        };
        if !transcript.append(turn) {
            return SubmitDecision::Closed;
        }

        let exchange = ExchangeId(self.next_exchange);
        self.next_exchange += 1;
        self.last_submitted = Some(text.to_string());
        self.last_submit_at = Some(Instant::now());
        state.set_in_flight(true);

        let history = transcript.turns().to_vec();
        let turns = history.len();
        let generator = Arc::clone(&self.generator);
        let timeout = self.config.reply_timeout();
        let guard = CompletionGuard::new(
            self.events.clone(),
            CallEvent::Exchange(DispatchOutcome {
                exchange,
                result: Err(CallError::Generation("exchange aborted".to_string())),
            }),
        );
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, generator.generate_reply(&history, false)).await {
                Ok(result) => result,
                Err(_) => Err(CallError::Timeout(timeout)),
            };
            guard.complete(CallEvent::Exchange(DispatchOutcome { exchange, result }));
        });
        self.in_flight = Some(InFlight { exchange, task });
        info!(exchange = exchange.0, turns, "user turn submitted");
        decision
    }

    fn check(
        &self,
        text: &str,
        state: &SpeechCoordinatorState,
        transcript: &Transcript,
    ) -> SubmitDecision {
        if text.is_empty() {
            return SubmitDecision::Empty;
        }
        if transcript.is_frozen() {
            return SubmitDecision::Closed;
        }
        if state.ai_speaking() {
            return SubmitDecision::AiSpeaking;
        }
        if self.in_flight.is_some() || state.in_flight() {
            return SubmitDecision::InFlight;
        }
        if self.last_submitted.as_deref() == Some(text) {
            return SubmitDecision::Duplicate;
        }
        if let Some(at) = self.last_submit_at {
            let spacing = self.config.min_spacing();
            let elapsed = at.elapsed();
            if elapsed < spacing {
                return SubmitDecision::TooSoon {
                    retry_after: spacing - elapsed,
                };
            }
        }
        SubmitDecision::Accepted(ExchangeId(self.next_exchange))
    }

    /// Settle an exchange. Returns the reply to play (the fallback utterance on
    /// failure), or `None` for a stale outcome or a frozen transcript.
    pub fn on_outcome(
        &mut self,
        outcome: DispatchOutcome,
        state: &mut SpeechCoordinatorState,
        transcript: &mut Transcript,
    ) -> Option<Reply> {
        match &self.in_flight {
            Some(current) if current.exchange == outcome.exchange => {}
            _ => {
                debug!(exchange = outcome.exchange.0, "stale exchange outcome ignored");
                return None;
            }
        }
        self.in_flight = None;
        state.set_in_flight(false);

        let reply = match outcome.result {
            Ok(reply) if !reply.message.trim().is_empty() => {
                self.consecutive_failures = 0;
                reply
            }
            Ok(_) => self.fallback(CallError::Generation("empty reply".to_string())),
            Err(e) => self.fallback(e),
        };

        let turn = Turn::assistant(reply.message.as_str())?;
        if !transcript.append(turn) {
            return None;
        }
        Some(reply)
    }

    fn fallback(&mut self, error: CallError) -> Reply {
        self.consecutive_failures += 1;
        warn!(
            error = %error,
            consecutive_failures = self.consecutive_failures,
            "reply generation failed; using fallback utterance"
        );
        self.last_failure = Some(error.to_string());
        Reply::text_only(non_blank(&self.config.fallback_utterance, DEFAULT_FALLBACK_UTTERANCE), false)
    }

    /// The prospect's opening line, or the fallback opening if generation fails or times out.
    pub async fn opening_line(&self) -> Reply {
        let timeout = self.config.reply_timeout();
        let result = match tokio::time::timeout(timeout, self.generator.generate_reply(&[], true)).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout(timeout)),
        };
        match result {
            Ok(reply) if !reply.message.trim().is_empty() => reply,
            Ok(_) => {
                warn!("opening line was empty; using fallback opening");
                self.fallback_opening()
            }
            Err(e) => {
                warn!(error = %e, "opening line generation failed; using fallback opening");
                self.fallback_opening()
            }
        }
    }

    fn fallback_opening(&self) -> Reply {
        Reply::text_only(non_blank(&self.config.fallback_opening, DEFAULT_FALLBACK_OPENING), false)
    }

    /// Generation has failed too many times in a row to keep the call going.
    pub fn exhausted(&self) -> bool {
        self.config.max_consecutive_failures > 0
            && self.consecutive_failures >= self.config.max_consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Description of the most recent generation failure.
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Drop the in-flight exchange; its late result will be ignored.
    pub fn abandon(&mut self, state: &mut SpeechCoordinatorState) {
        if let Some(current) = self.in_flight.take() {
            debug!(exchange = current.exchange.0, "abandoning in-flight exchange");
            current.task.abort();
        }
        state.set_in_flight(false);
    }
}

fn non_blank<'a>(text: &'a str, default: &'a str) -> &'a str {
    if text.trim().is_empty() {
        default
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{ScriptedReply, ScriptedReplyGenerator};

    struct Fixture {
        dispatcher: TurnDispatcher,
        generator: ScriptedReplyGenerator,
        state: SpeechCoordinatorState,
        transcript: Transcript,
        events: mpsc::UnboundedReceiver<CallEvent>,
    }

    fn fixture(replies: Vec<ScriptedReply>) -> Fixture {
        let (tx, events) = mpsc::unbounded_channel();
        let generator = ScriptedReplyGenerator::new(replies);
        Fixture {
            dispatcher: TurnDispatcher::new(
                &DispatchConfig::default(),
                Arc::new(generator.clone()),
                tx,
            ),
            generator,
            state: SpeechCoordinatorState::new(),
            transcript: Transcript::new(),
            events,
        }
    }

    impl Fixture {
        fn submit(&mut self, text: &str) -> SubmitDecision {
            self.dispatcher
                .submit(text, &mut self.state, &mut self.transcript)
        }

        async fn settle(&mut self) -> Option<Reply> {
            match self.events.recv().await {
                Some(CallEvent::Exchange(outcome)) => {
                    self.dispatcher
                        .on_outcome(outcome, &mut self.state, &mut self.transcript)
                }
                other => panic!("expected exchange outcome, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn accepted_turn_is_appended_and_answered() {
        let mut f = fixture(vec![ScriptedReply::say("C'est à quel sujet ?")]);

        assert!(matches!(f.submit("Bonjour, je suis Marc."), SubmitDecision::Accepted(_)));
        assert!(f.state.in_flight());
        assert_eq!(f.transcript.len(), 1);

        let reply = f.settle().await.unwrap();
        assert_eq!(reply.message, "C'est à quel sujet ?");
        assert!(!f.state.in_flight());
        assert_eq!(f.transcript.len(), 2);
        assert_eq!(f.generator.calls()[0].history.len(), 1);
    }

    #[tokio::test]
    async fn second_submission_while_in_flight_is_a_no_op() {
        let mut f = fixture(vec![ScriptedReply::say("Oui ?").after(Duration::from_millis(50))]);

        assert!(matches!(f.submit("Je vous appelle pour un rendez-vous."), SubmitDecision::Accepted(_)));
        assert_eq!(f.submit("Vous avez deux minutes ?"), SubmitDecision::InFlight);
        assert_eq!(f.transcript.user_turns().count(), 1);

        f.settle().await;
        assert_eq!(f.generator.call_count(), 1);
        assert_eq!(f.transcript.user_turns().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_text_is_submitted_once() {
        let mut f = fixture(vec![]);

        assert!(matches!(f.submit("Bonjour, je suis Marc."), SubmitDecision::Accepted(_)));
        f.settle().await;
        assert_eq!(f.submit("Bonjour, je suis Marc."), SubmitDecision::Duplicate);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.submit("Bonjour, je suis Marc."), SubmitDecision::Duplicate);
        assert_eq!(f.transcript.user_turns().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_respect_minimum_spacing() {
        let mut f = fixture(vec![]);

        f.submit("Bonjour, je suis Marc.");
        f.settle().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        match f.submit("Je vous appelle pour un rendez-vous.") {
            SubmitDecision::TooSoon { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(1000))
            }
            other => panic!("expected TooSoon, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(matches!(
            f.submit("Je vous appelle pour un rendez-vous."),
            SubmitDecision::Accepted(_)
        ));
    }

    #[tokio::test]
    async fn nothing_is_submitted_while_prospect_speaks() {
        let mut f = fixture(vec![]);
        f.state.set_ai_speaking(true);

        assert_eq!(f.submit("Bonjour, je suis Marc."), SubmitDecision::AiSpeaking);
        assert!(f.transcript.is_empty());
        assert_eq!(f.submit("   "), SubmitDecision::Empty);
    }

    #[tokio::test]
    async fn failure_falls_back_and_releases_lock() {
        let mut f = fixture(vec![ScriptedReply::fail("503"), ScriptedReply::say("Oui ?")]);

        f.submit("Bonjour, je suis Marc.");
        let reply = f.settle().await.unwrap();
        assert_eq!(reply.message, "Pardon ?");
        assert!(!f.dispatcher.is_in_flight());
        assert_eq!(f.dispatcher.consecutive_failures(), 1);
        assert_eq!(f.transcript.last().unwrap().text(), "Pardon ?");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_generation_times_out_into_fallback() {
        let mut f = fixture(vec![ScriptedReply::Stall]);

        f.submit("Bonjour, je suis Marc.");
        let started = Instant::now();
        let reply = f.settle().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(reply.message, "Pardon ?");
        assert!(f.dispatcher.last_failure().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn repeated_failures_exhaust_the_dispatcher() {
        let mut f = fixture(vec![
            ScriptedReply::fail("a"),
            ScriptedReply::fail("b"),
            ScriptedReply::fail("c"),
        ]);
        f.dispatcher.config.min_spacing_ms = 0;

        for text in ["un deux trois quatre", "cinq six sept huit", "neuf dix onze douze"] {
            assert!(matches!(f.submit(text), SubmitDecision::Accepted(_)));
            f.settle().await;
        }
        assert!(f.dispatcher.exhausted());
    }

    #[tokio::test]
    async fn abandoned_exchange_result_is_ignored() {
        let mut f = fixture(vec![ScriptedReply::say("Trop tard").after(Duration::from_millis(10))]);

        f.submit("Bonjour, je suis Marc.");
        f.dispatcher.abandon(&mut f.state);
        f.transcript.freeze();

        assert!(f.settle().await.is_none());
        assert_eq!(f.transcript.len(), 1);
    }

    #[tokio::test]
    async fn opening_line_falls_back_when_generation_fails() {
        let f = fixture(vec![ScriptedReply::fail("offline")]);
        assert_eq!(f.dispatcher.opening_line().await.message, "Allô ?");
    }
}
