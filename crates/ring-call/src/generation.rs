//! **Reply generation** — the simulated prospect's side of the conversation.

use crate::chat::{ChatClient, ChatMessage};
use crate::error::{CallError, CallResult};
use crate::persona::TrainingConfig;
use crate::playback::{estimate_speech_duration, AudioClip};
use crate::transcript::{Speaker, Turn};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Appended by the model when the prospect ends the conversation.
pub const END_CALL_MARKER: &str = "[FIN_APPEL]";

const OPENING_INSTRUCTION: &str =
    "Le téléphone sonne et tu décroches. Dis uniquement ta première phrase.";

/// The prospect's next utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub message: String,
    pub audio: AudioClip,
    /// Hang up once this reply has been played.
    pub should_end_call: bool,
}

impl Reply {
    /// Reply without synthesized audio; playback time is estimated from the text.
    pub fn text_only(message: impl Into<String>, should_end_call: bool) -> Self {
        let message = message.into();
        Self {
            audio: AudioClip::estimated_for_text(&message),
            message,
            should_end_call,
        }
    }
}

/// Language generation collaborator.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Next prospect utterance given the transcript so far. `history` is empty
    /// and `is_first_turn` true for the opening line.
    async fn generate_reply(&self, history: &[Turn], is_first_turn: bool) -> CallResult<Reply>;
}

/// Strip the end-of-call marker. Returns the cleaned text and whether the marker was present.
pub fn split_end_marker(raw: &str) -> (String, bool) {
    if raw.contains(END_CALL_MARKER) {
        (raw.replace(END_CALL_MARKER, "").trim().to_string(), true)
    } else {
        (raw.trim().to_string(), false)
    }
}

/// Production generator: chat completion with the persona prompt, then speech synthesis.
pub struct ChatReplyGenerator {
    client: ChatClient,
    training: TrainingConfig,
    temperature: f32,
}

impl ChatReplyGenerator {
    pub fn new(client: ChatClient, training: TrainingConfig) -> Self {
        Self {
            client,
            training,
            temperature: 0.8,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn messages(&self, history: &[Turn], is_first_turn: bool) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.training.system_prompt()));
        if is_first_turn {
            messages.push(ChatMessage::user(OPENING_INSTRUCTION));
        }
        messages.extend(history.iter().map(|turn| match turn.speaker() {
            Speaker::User => ChatMessage::user(turn.text()),
            Speaker::Assistant => ChatMessage::assistant(turn.text()),
        }));
        messages
    }
}

#[async_trait]
impl ReplyGenerator for ChatReplyGenerator {
    async fn generate_reply(&self, history: &[Turn], is_first_turn: bool) -> CallResult<Reply> {
        let raw = self
            .client
            .complete(&self.messages(history, is_first_turn), self.temperature, false)
            .await?;
        let (message, should_end_call) = split_end_marker(&raw);
        if message.is_empty() {
            return Err(CallError::Generation("model returned an empty reply".to_string()));
        }

        let duration = Some(estimate_speech_duration(&message));
        let audio = match self.client.synthesize(&message).await {
            Ok(bytes) => AudioClip::new(bytes, "audio/mpeg", duration),
            Err(e) => {
                warn!(error = %e, "speech synthesis failed; reply will be shown without audio");
                AudioClip::estimated_for_text(&message)
            }
        };
        debug!(chars = message.len(), should_end_call, "reply generated");
        Ok(Reply {
            message,
            audio,
            should_end_call,
        })
    }
}

/// One scripted outcome of [`ScriptedReplyGenerator`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Say {
        text: String,
        end_call: bool,
        latency: Duration,
        audio: Option<AudioClip>,
    },
    Fail(String),
    /// Never resolves (exercises the reply timeout).
    Stall,
}

impl ScriptedReply {
    pub fn say(text: impl Into<String>) -> Self {
        ScriptedReply::Say {
            text: text.into(),
            end_call: false,
            latency: Duration::ZERO,
            audio: None,
        }
    }

    pub fn say_and_hang_up(text: impl Into<String>) -> Self {
        ScriptedReply::Say {
            text: text.into(),
            end_call: true,
            latency: Duration::ZERO,
            audio: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        ScriptedReply::Fail(reason.into())
    }

    /// Resolve after `latency` instead of immediately.
    pub fn after(self, latency: Duration) -> Self {
        match self {
            ScriptedReply::Say {
                text,
                end_call,
                audio,
                ..
            } => ScriptedReply::Say {
                text,
                end_call,
                latency,
                audio,
            },
            other => other,
        }
    }

    /// Play `clip` instead of an estimated one.
    pub fn with_audio(self, clip: AudioClip) -> Self {
        match self {
            ScriptedReply::Say {
                text,
                end_call,
                latency,
                ..
            } => ScriptedReply::Say {
                text,
                end_call,
                latency,
                audio: Some(clip),
            },
            other => other,
        }
    }
}

/// What a [`ScriptedReplyGenerator`] was asked.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationCall {
    pub is_first_turn: bool,
    pub history: Vec<Turn>,
}

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<ScriptedReply>,
    calls: Vec<GenerationCall>,
}

/// Generator that plays back a queue of scripted replies. When the queue runs
/// dry every request gets a neutral acknowledgement.
#[derive(Clone, Default)]
pub struct ScriptedReplyGenerator {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedReplyGenerator {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        let generator = Self::default();
        for reply in replies {
            generator.push(reply);
        }
        generator
    }

    pub fn push(&self, reply: ScriptedReply) {
        if let Ok(mut state) = self.state.lock() {
            state.replies.push_back(reply);
        }
    }

    pub fn calls(&self) -> Vec<GenerationCall> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().map(|state| state.calls.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedReplyGenerator {
    async fn generate_reply(&self, history: &[Turn], is_first_turn: bool) -> CallResult<Reply> {
        let next = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| CallError::Generation("script state poisoned".to_string()))?;
            state.calls.push(GenerationCall {
                is_first_turn,
                history: history.to_vec(),
            });
            state.replies.pop_front()
        };

        match next.unwrap_or_else(|| ScriptedReply::say("D'accord, je vous écoute.")) {
            ScriptedReply::Say {
                text,
                end_call,
                latency,
                audio,
            } => {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                let mut reply = Reply::text_only(text, end_call);
                if let Some(clip) = audio {
                    reply.audio = clip;
                }
                Ok(reply)
            }
            ScriptedReply::Fail(reason) => Err(CallError::Generation(reason)),
            ScriptedReply::Stall => {
                std::future::pending::<()>().await;
                Err(CallError::Generation("stalled".to_string()))
            }
        }
    }
}
