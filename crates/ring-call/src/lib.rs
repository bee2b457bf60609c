//! # Ring Call - Turn-Taking Engine for Simulated Cold Calls
//!
//! A trainee phones an AI-simulated prospect. This crate decides when the
//! trainee has finished speaking, sends that turn to the language model, keeps
//! the trainee's and the prospect's speech from stepping on each other, and
//! recovers from failures without leaving a stuck call.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Call Session (one task)                      │
//! │                                                                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐     │
//! │  │  Recognizer  │ → │  Transcript  │ → │ Turn Dispatcher  │ → LLM│
//! │  │ (final+int.) │   │ Accumulator  │   │ (1 in flight)    │     │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘     │
//! │         ↑                  ↑ flush              ↓ reply          │
//! │  ┌────────────────────────────────────────────────────────┐     │
//! │  │   Speech Coordinator (ai_speaking, restart policy)     │     │
//! │  └────────────────────────────────────────────────────────┘     │
//! │         ↑                                       ↓                │
//! │  Dialing → Ringing → Connected → Ended ──→ Scorer → SessionResult │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Audio capture, speech recognition, reply generation, playback and scoring
//! are collaborators behind traits; scripted versions ship with the crate.

pub mod accumulator;
pub mod call;
pub mod chat;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod generation;
pub mod persona;
pub mod playback;
pub mod recognizer;
pub mod scoring;
pub mod speech;
pub mod timer;
pub mod transcript;
pub mod utterance;

pub use accumulator::TranscriptAccumulator;
pub use call::{
    CallCollaborators, CallHandle, CallState, CallStateTransition, EndReason, PhoneCall,
    SessionResult,
};
pub use chat::{ChatClient, ChatMessage};
pub use config::{AccumulatorConfig, CallConfig, DispatchConfig, ListeningConfig, ScoringConfig};
pub use dispatcher::{DispatchOutcome, ExchangeId, SubmitDecision, TurnDispatcher};
pub use error::{CallError, CallResult, MicrophoneErrorKind};
pub use event::CallEvent;
pub use generation::{
    ChatReplyGenerator, GenerationCall, Reply, ReplyGenerator, ScriptedReply,
    ScriptedReplyGenerator, END_CALL_MARKER,
};
pub use persona::{Difficulty, Persona, TrainingConfig};
pub use playback::{AudioClip, AudioPlayer, SimulatedPlayer};
pub use recognizer::{
    RecognitionEvent, RecognizerProbe, ScriptedRecognizer, SpeechRecognizer, TransportState,
};
pub use scoring::{fallback_score, CallScorer, ChatCallScorer, LocalScorer, ScoreReport};
pub use speech::{SpeechCoordinator, SpeechCoordinatorState};
pub use timer::{Timer, TimerToken};
pub use transcript::{Speaker, Transcript, Turn};
pub use utterance::{classify, is_complete_utterance, CompletionRule, UtteranceRules};
