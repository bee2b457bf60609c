//! Tunable parameters for the turn-taking engine.
//!
//! The thresholds below were tuned by ear for French cold calls; treat them as
//! knobs, not constants. Load order: defaults, then `$RING_CONFIG`
//! (default `config/ring-call`, any format the `config` crate understands),
//! then `RING__<SECTION>__<KEY>` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default apology spoken when a reply cannot be generated.
pub const DEFAULT_FALLBACK_UTTERANCE: &str = "Pardon ?";

/// Default opening line when the prospect's first words cannot be generated.
pub const DEFAULT_FALLBACK_OPENING: &str = "Allô ?";

/// Transcript accumulation and utterance completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    /// Quiet time after the last interim result before the buffer is evaluated (default 1500ms).
    pub debounce_ms: u64,
    /// Text longer than this (in chars) is complete regardless of shape (default 40).
    pub length_threshold: usize,
    /// Shape rules (introduction, question, ...) need at least this many chars (default 12).
    pub min_shape_chars: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1500,
            length_threshold: 40,
            min_shape_chars: 12,
        }
    }
}

impl AccumulatorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// User turn submission to the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Minimum time between two user submissions (default 1300ms).
    pub min_spacing_ms: u64,
    /// Bounded wait for a generated reply (default 15s).
    pub reply_timeout_ms: u64,
    /// Spoken when generation fails or times out.
    pub fallback_utterance: String,
    /// Spoken when the opening line fails or times out.
    pub fallback_opening: String,
    /// Fallbacks in a row before the failure is reported on the session result (default 3).
    pub max_consecutive_failures: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_spacing_ms: 1300,
            reply_timeout_ms: 15_000,
            fallback_utterance: DEFAULT_FALLBACK_UTTERANCE.to_string(),
            fallback_opening: DEFAULT_FALLBACK_OPENING.to_string(),
            max_consecutive_failures: 3,
        }
    }
}

impl DispatchConfig {
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Microphone / recognition engine lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListeningConfig {
    /// Delay before restarting a recognition engine that terminated (default 300ms).
    pub restart_delay_ms: u64,
    /// Start recognition as soon as the call connects so speech over the
    /// opening line is buffered and flushed once it finishes (default true).
    /// When false the microphone opens after the opening line.
    pub capture_during_opening: bool,
    /// Upper bound for the restart delay while restarts keep failing (default 5s).
    pub max_restart_delay_ms: u64,
    /// Failed restarts in a row before the call gives up on the microphone (default 5).
    pub max_restart_failures: u32,
}

impl Default for ListeningConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 300,
            capture_during_opening: true,
            max_restart_delay_ms: 5_000,
            max_restart_failures: 5,
        }
    }
}

impl ListeningConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn max_restart_delay(&self) -> Duration {
        Duration::from_millis(self.max_restart_delay_ms.max(self.restart_delay_ms))
    }
}

/// End-of-call scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Bounded wait for the scoring collaborator before falling back (default 30s).
    pub timeout_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl ScoringConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for one simulated call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub accumulator: AccumulatorConfig,
    pub dispatch: DispatchConfig,
    pub listening: ListeningConfig,
    pub scoring: ScoringConfig,
}

impl CallConfig {
    /// Load config from file and environment. Precedence: env vars > `$RING_CONFIG` file > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("RING_CONFIG").unwrap_or_else(|_| "config/ring-call".to_string());

        let built = config::Config::builder()
            .add_source(config::Config::try_from(&CallConfig::default())?)
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("RING")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        built.try_deserialize()
    }
}
