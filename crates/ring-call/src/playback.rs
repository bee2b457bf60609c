//! **Playback** — the prospect's voice and the ringtone.
//!
//! `AudioPlayer::play` resolves when the clip has finished playing; that is the
//! moment the prospect gives the floor back. `stop()` cuts everything short and
//! makes pending `play` calls resolve.

use crate::error::CallResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Rough speaking rate used when a clip carries no duration.
const MS_PER_WORD: u64 = 350;
const MIN_SPEECH_MS: u64 = 600;

/// Synthesized speech for one assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioClip {
    /// Encoded audio (e.g. MP3). Empty when synthesis was skipped or failed.
    pub bytes: Vec<u8>,
    /// MIME type of `bytes` (e.g. `audio/mpeg`).
    pub mime: String,
    /// Known or estimated play time.
    pub duration: Option<Duration>,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>, duration: Option<Duration>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
            duration,
        }
    }

    /// No audio, but occupies the floor for `duration`.
    pub fn silent(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            ..Self::default()
        }
    }

    /// No audio; duration estimated from the words that would have been spoken.
    pub fn estimated_for_text(text: &str) -> Self {
        Self::silent(estimate_speech_duration(text))
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub fn estimate_speech_duration(text: &str) -> Duration {
    let words = text.split_whitespace().count() as u64;
    Duration::from_millis((words * MS_PER_WORD).max(MIN_SPEECH_MS))
}

/// Audio output for the call.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Play one assistant clip; resolves when playback has finished or was stopped.
    /// Use `CallError::PlaybackDevice` for failures that make further playback impossible.
    async fn play(&self, clip: &AudioClip) -> CallResult<()>;

    /// Play the outgoing-call ringtone; resolves when it has finished.
    async fn play_ringtone(&self) -> CallResult<()>;

    /// Stop all audio immediately.
    fn stop(&self);
}

/// Player that only waits out each clip's duration. Use for tests and demos
/// without an audio device.
pub struct SimulatedPlayer {
    ringtone: Duration,
    stop_signal: Notify,
    played: Mutex<Vec<AudioClip>>,
    stops: AtomicUsize,
}

impl SimulatedPlayer {
    pub fn new(ringtone: Duration) -> Self {
        Self {
            ringtone,
            stop_signal: Notify::new(),
            played: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }
    }

    /// Clips handed to `play`, in order.
    pub fn played(&self) -> Vec<AudioClip> {
        self.played
            .lock()
            .map(|clips| clips.clone())
            .unwrap_or_default()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    async fn hold(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop_signal.notified() => debug!("simulated playback stopped early"),
        }
    }
}

impl Default for SimulatedPlayer {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl AudioPlayer for SimulatedPlayer {
    async fn play(&self, clip: &AudioClip) -> CallResult<()> {
        if let Ok(mut played) = self.played.lock() {
            played.push(clip.clone());
        }
        let duration = clip
            .duration
            .unwrap_or_else(|| Duration::from_millis(MIN_SPEECH_MS));
        self.hold(duration).await;
        Ok(())
    }

    async fn play_ringtone(&self) -> CallResult<()> {
        self.hold(self.ringtone).await;
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn speech_duration_scales_with_words() {
        assert_eq!(estimate_speech_duration("Pardon ?"), Duration::from_millis(700));
        assert_eq!(estimate_speech_duration(""), Duration::from_millis(600));
        assert!(AudioClip::estimated_for_text("Allô ?").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn play_waits_for_clip_duration() {
        let player = SimulatedPlayer::default();
        let started = Instant::now();
        player
            .play(&AudioClip::silent(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(player.played().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cuts_playback_short() {
        let player = Arc::new(SimulatedPlayer::default());
        let started = Instant::now();

        let playing = {
            let player = Arc::clone(&player);
            tokio::spawn(async move { player.play(&AudioClip::silent(Duration::from_secs(10))).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        player.stop();

        playing.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(player.stop_count(), 1);
    }
}
