//! **Utterance completion** — decide whether buffered speech is worth submitting as a turn.
//!
//! A heuristic, not a grammar. Submitting a fragment mid-thought costs more than
//! waiting a little longer, so short ambiguous text is held back and a turn is
//! accepted once there is recognizable conversational shape or enough raw length.
//! The patterns are French cold-call phrasing and need re-tuning for other languages.

use crate::config::AccumulatorConfig;
use once_cell::sync::Lazy;
use regex::Regex;

/// Words that carry no actionable meaning on their own ("oui", "allô", ...).
const ACKNOWLEDGEMENTS: &[&str] = &[
    "oui", "ouais", "non", "si", "allô", "allo", "bonjour", "bonsoir", "salut", "hello", "ok",
    "okay", "d'accord", "merci", "euh", "hum", "hmm", "ah", "oh", "bien", "voilà", "yes", "no",
    "hein", "pardon", "quoi", "comment", "excusez-moi",
];

/// Up to this many acknowledgement words in a row still count as bare.
const MAX_ACKNOWLEDGEMENT_WORDS: usize = 3;

static SELF_INTRODUCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:je suis|je m'appelle|moi c'est|de la société|de la part de|de chez|je travaille (?:chez|pour|dans))\b",
    )
    .expect("self introduction pattern")
});

static REASON_FOR_CONTACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:je vous appelle|je vous contacte|j'appelle|je me permets|je souhaite|j'aimerais|je voudrais|je vous propose|vous proposer|vous présenter|vous parler|au sujet d|concernant|à propos d|c'est pour)",
    )
    .expect("reason for contact pattern")
});

static QUESTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:est-ce qu|qu'est-ce|qui\b|quand\b|comment\b|pourquoi\b|quel(?:le)?s?\b|combien\b|où\b)|\best-ce qu|\b(?:avez|êtes|pouvez|pourriez|voulez|voudriez|seriez|auriez|savez|connaissez|utilisez|travaillez|serait|est|peut|pourrait|peux)-(?:vous|tu|il|elle|on)\b",
    )
    .expect("question pattern")
});

static OBJECTION_RESPONSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:je comprends|justement|parce que|puisque|pour (?:que|vous|votre|cela|ça)|afin de|avec (?:vous|votre)|sans (?:engagement|frais|obligation)|au lieu de|grâce à)\b",
    )
    .expect("objection response pattern")
});

/// Thresholds used by the completion rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtteranceRules {
    /// Text longer than this many chars is complete whatever its shape.
    pub length_threshold: usize,
    /// Shape rules only apply to text at least this long.
    pub min_shape_chars: usize,
}

impl Default for UtteranceRules {
    fn default() -> Self {
        Self::from(&AccumulatorConfig::default())
    }
}

impl From<&AccumulatorConfig> for UtteranceRules {
    fn from(config: &AccumulatorConfig) -> Self {
        Self {
            length_threshold: config.length_threshold,
            min_shape_chars: config.min_shape_chars,
        }
    }
}

/// Why a piece of text was judged complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionRule {
    /// Ends in `.`, `!`, `?` or `…`.
    TerminalPunctuation,
    /// "je suis Marc", "de la société X", ...
    SelfIntroduction,
    /// "je vous appelle au sujet de", "j'aimerais vous proposer", ...
    ReasonForContact,
    /// Interrogative opening or inverted verb ("avez-vous", "est-ce que").
    Question,
    /// Objection handling built on a prepositional clause ("je comprends, justement avec nous").
    ObjectionResponse,
    /// Long enough to act on regardless of shape.
    LengthThreshold,
}

impl CompletionRule {
    /// Evaluation order; the first match wins.
    pub const ALL: [CompletionRule; 6] = [
        CompletionRule::TerminalPunctuation,
        CompletionRule::SelfIntroduction,
        CompletionRule::ReasonForContact,
        CompletionRule::Question,
        CompletionRule::ObjectionResponse,
        CompletionRule::LengthThreshold,
    ];

    /// Check this single rule against already-normalized text.
    pub fn matches(self, normalized: &str, rules: &UtteranceRules) -> bool {
        let long_enough = normalized.chars().count() >= rules.min_shape_chars;
        match self {
            Self::TerminalPunctuation => ends_with_terminal_punctuation(normalized),
            Self::SelfIntroduction => long_enough && SELF_INTRODUCTION.is_match(normalized),
            Self::ReasonForContact => long_enough && REASON_FOR_CONTACT.is_match(normalized),
            Self::Question => long_enough && QUESTION.is_match(normalized),
            Self::ObjectionResponse => long_enough && OBJECTION_RESPONSE.is_match(normalized),
            Self::LengthThreshold => normalized.chars().count() > rules.length_threshold,
        }
    }
}

/// Lowercase, unify apostrophes and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.replace(['’', '`'], "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn ends_with_terminal_punctuation(text: &str) -> bool {
    text.trim_end()
        .ends_with(['.', '!', '?', '…'])
}

/// True for text made only of a few acknowledgement words ("oui", "allô ?", "non non").
pub fn is_bare_acknowledgement(text: &str) -> bool {
    let normalized = normalize(text);
    let words: Vec<&str> = normalized
        .split(|c: char| c.is_whitespace() || matches!(c, '.' | ',' | '!' | '?' | '…' | ';' | ':'))
        .filter(|w| !w.is_empty())
        .collect();

    words.len() <= MAX_ACKNOWLEDGEMENT_WORDS && words.iter().all(|w| ACKNOWLEDGEMENTS.contains(w))
}

/// First rule the text satisfies, or `None` if it should wait for more speech.
pub fn classify(text: &str, rules: &UtteranceRules) -> Option<CompletionRule> {
    if is_bare_acknowledgement(text) {
        return None;
    }
    let normalized = normalize(text);
    CompletionRule::ALL
        .into_iter()
        .find(|rule| rule.matches(&normalized, rules))
}

pub fn is_complete_utterance(text: &str, rules: &UtteranceRules) -> bool {
    classify(text, rules).is_some()
}
