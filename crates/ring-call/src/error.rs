//! Error types for the Ring Academy call engine

use std::time::Duration;
use thiserror::Error;

/// Result type alias for call operations
pub type CallResult<T> = Result<T, CallError>;

/// Why the microphone could not be acquired (or was lost mid-call).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneErrorKind {
    /// The user (or the OS) refused microphone access.
    PermissionDenied,
    /// No capture device is available.
    NoDevice,
    /// Anything else reported by the capture layer.
    Unknown,
}

impl MicrophoneErrorKind {
    /// Actionable message shown to the trainee.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Accès au micro refusé. Autorisez le micro dans votre navigateur puis relancez l'appel."
            }
            Self::NoDevice => {
                "Aucun micro détecté. Branchez un micro ou un casque puis relancez l'appel."
            }
            Self::Unknown => {
                "Le micro est indisponible. Vérifiez votre matériel puis relancez l'appel."
            }
        }
    }
}

/// Errors that can occur while running a simulated call
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Microphone error ({kind:?}): {detail}")]
    Microphone {
        kind: MicrophoneErrorKind,
        detail: String,
    },

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    #[error("Reply generation error: {0}")]
    Generation(String),

    #[error("Reply generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Scoring error: {0}")]
    Scoring(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Audio output device error: {0}")]
    PlaybackDevice(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Call already ended")]
    CallEnded,

    #[error("Call task failed: {0}")]
    Task(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CallError {
    pub fn microphone(kind: MicrophoneErrorKind, detail: impl Into<String>) -> Self {
        CallError::Microphone {
            kind,
            detail: detail.into(),
        }
    }

    /// Only device (microphone, audio output) and transport failures abort a
    /// call; everything else degrades and the conversation keeps moving.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::Microphone { .. } | CallError::Transport(_) | CallError::PlaybackDevice(_)
        )
    }

    /// Message suitable for the trainee, when the error is one they can act on.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            CallError::Microphone { kind, .. } => Some(kind.user_message()),
            CallError::Transport(_) => {
                Some("La connexion a été interrompue. Vérifiez votre réseau puis relancez l'appel.")
            }
            _ => None,
        }
    }
}

impl From<config::ConfigError> for CallError {
    fn from(err: config::ConfigError) -> Self {
        CallError::Config(err.to_string())
    }
}
