//! Conversation transcript: append-only while the call is connected, frozen once it ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The trainee.
    User,
    /// The simulated prospect.
    Assistant,
}

/// One finalized utterance. Never edited after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    speaker: Speaker,
    text: String,
    at: DateTime<Utc>,
}

impl Turn {
    /// Build a turn; returns `None` for blank text.
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Option<Self> {
        let text = text.into().trim().to_string();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            speaker,
            text,
            at: Utc::now(),
        })
    }

    pub fn user(text: impl Into<String>) -> Option<Self> {
        Self::new(Speaker::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Option<Self> {
        Self::new(Speaker::Assistant, text)
    }

    pub fn speaker(&self) -> Speaker {
        self.speaker
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Ordered turns of one call. Insertion order is chronological order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
    frozen: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn. Returns false (and leaves the transcript untouched) once frozen.
    pub(crate) fn append(&mut self, turn: Turn) -> bool {
        if self.frozen {
            warn!(speaker = ?turn.speaker, "transcript frozen, dropping late turn");
            return false;
        }
        debug!(speaker = ?turn.speaker, index = self.turns.len(), text = %turn.text, "turn appended");
        self.turns.push(turn);
        true
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn user_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|t| t.speaker == Speaker::User)
    }

    pub fn user_word_count(&self) -> usize {
        self.user_turns().map(Turn::word_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_turns_are_rejected() {
        assert!(Turn::user("   ").is_none());
        assert!(Turn::assistant("").is_none());
        assert_eq!(Turn::user("  Bonjour  ").unwrap().text(), "Bonjour");
    }

    #[test]
    fn frozen_transcript_ignores_appends() {
        let mut transcript = Transcript::new();
        assert!(transcript.append(Turn::assistant("Allô ?").unwrap()));
        assert!(transcript.append(Turn::user("Bonjour, je suis Marc").unwrap()));

        transcript.freeze();
        assert!(!transcript.append(Turn::assistant("Au revoir").unwrap()));
        assert_eq!(transcript.len(), 2);
        assert!(transcript.is_frozen());
    }

    #[test]
    fn counts_user_words_only() {
        let mut transcript = Transcript::new();
        transcript.append(Turn::assistant("Allô ? Qui est à l'appareil ?").unwrap());
        transcript.append(Turn::user("Bonjour, je suis Marc").unwrap());
        transcript.append(Turn::user("de la société X").unwrap());

        assert_eq!(transcript.user_turns().count(), 2);
        assert_eq!(transcript.user_word_count(), 8);
    }
}
