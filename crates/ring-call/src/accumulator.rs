//! **Transcript accumulation** — from recognition fragments to whole utterances.
//!
//! Finalized fragments are appended, the interim tail is replaced on every
//! result. A final fragment that completes an utterance is emitted right away;
//! anything else waits for a quiet period (the debounce) before the buffer is
//! judged again. Nothing is emitted while the floor is taken; the buffer is
//! flushed when the prospect stops speaking.

use crate::config::AccumulatorConfig;
use crate::event::CallEvent;
use crate::speech::SpeechCoordinatorState;
use crate::timer::{Timer, TimerToken};
use crate::utterance::{is_complete_utterance, UtteranceRules};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub struct TranscriptAccumulator {
    rules: UtteranceRules,
    debounce: Duration,
    finalized: String,
    interim: String,
    /// Emit on the next debounce even if the text does not look complete
    /// (text handed back by the dispatcher).
    force_next: bool,
    /// Interim words already handed over by `flush`, skipped when the
    /// recognizer finalizes them.
    absorbed: String,
    timer: Timer<CallEvent>,
}

impl TranscriptAccumulator {
    pub fn new(config: &AccumulatorConfig, events: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self {
            rules: UtteranceRules::from(config),
            debounce: config.debounce(),
            finalized: String::new(),
            interim: String::new(),
            force_next: false,
            absorbed: String::new(),
            timer: Timer::new("debounce", events),
        }
    }

    /// Merge one recognition result. Returns a candidate turn when the finalized
    /// text is complete and the floor is free.
    pub fn on_recognition_result(
        &mut self,
        final_fragment: &str,
        interim_fragment: &str,
        state: &SpeechCoordinatorState,
    ) -> Option<String> {
        let (raw_final, raw_interim) = (final_fragment.trim(), interim_fragment.trim());
        let final_fragment = strip_absorbed(&self.absorbed, raw_final);
        let interim_fragment = strip_absorbed(&self.absorbed, raw_interim);
        // Absorbed words stay pending until the recognizer finalizes or drops them.
        if !raw_final.is_empty() || (!raw_interim.is_empty() && interim_fragment == raw_interim) {
            self.absorbed.clear();
        }
        if final_fragment.is_empty() && interim_fragment.is_empty() {
            return None;
        }

        if !final_fragment.is_empty() {
            append_words(&mut self.finalized, final_fragment);
        }
        self.interim.clear();
        self.interim.push_str(interim_fragment);
        trace!(finalized = %self.finalized, interim = %self.interim, "recognition result");

        if state.floor_taken() {
            self.timer.cancel();
            return None;
        }

        if !final_fragment.is_empty() && is_complete_utterance(&self.finalized, &self.rules) {
            return self.take_finalized();
        }
        self.arm_debounce(self.debounce);
        None
    }

    /// The quiet period elapsed. Stale tokens are ignored.
    pub fn on_debounce_elapsed(
        &mut self,
        token: TimerToken,
        state: &SpeechCoordinatorState,
    ) -> Option<String> {
        if !self.timer.accept(token) || state.floor_taken() {
            return None;
        }
        let candidate = self.pending_text();
        if candidate.is_empty() {
            return None;
        }
        if self.force_next || is_complete_utterance(&candidate, &self.rules) {
            return self.take_all();
        }
        debug!(text = %candidate, "utterance still incomplete after quiet period");
        None
    }

    /// Hand over everything buffered as one turn, regardless of shape. Does
    /// nothing unless some text was finalized; a lone interim keeps waiting
    /// for its debounce.
    pub fn flush(&mut self) -> Option<String> {
        if self.finalized.trim().is_empty() {
            if !self.interim.is_empty() {
                self.arm_debounce(self.debounce);
            }
            return None;
        }
        let text = self.pending_text();
        let absorbed = std::mem::take(&mut self.interim);
        self.reset();
        self.absorbed = absorbed;
        debug!(text = %text, "flushing buffered speech");
        Some(text)
    }

    /// Put back text the dispatcher could not take yet. With `retry_after`, it
    /// is re-offered once that delay passes; otherwise it waits for the next flush.
    pub fn requeue(&mut self, text: &str, retry_after: Option<Duration>) {
        let mut merged = text.trim().to_string();
        append_words(&mut merged, &self.finalized);
        self.finalized = merged;
        if let Some(delay) = retry_after {
            self.force_next = true;
            self.arm_debounce(delay);
        }
    }

    pub(crate) fn cancel_debounce(&mut self) {
        self.timer.cancel();
    }

    /// Drop buffered text and cancel the debounce.
    pub fn reset(&mut self) {
        self.finalized.clear();
        self.interim.clear();
        self.force_next = false;
        self.absorbed.clear();
        self.timer.cancel();
    }

    /// Finalized text followed by the interim tail.
    pub fn pending_text(&self) -> String {
        let mut text = self.finalized.clone();
        append_words(&mut text, &self.interim);
        text
    }

    pub fn is_empty(&self) -> bool {
        self.finalized.is_empty() && self.interim.is_empty()
    }

    fn take_finalized(&mut self) -> Option<String> {
        self.timer.cancel();
        self.force_next = false;
        let text = std::mem::take(&mut self.finalized);
        if !self.interim.is_empty() {
            self.arm_debounce(self.debounce);
        }
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    fn take_all(&mut self) -> Option<String> {
        let text = self.pending_text();
        self.reset();
        Some(text)
    }

    fn arm_debounce(&mut self, delay: Duration) {
        self.timer.schedule(delay, CallEvent::DebounceElapsed);
    }
}

/// `fragment` without the leading words a flush already submitted.
fn strip_absorbed<'a>(absorbed: &str, fragment: &'a str) -> &'a str {
    if absorbed.is_empty() {
        return fragment;
    }
    match fragment.strip_prefix(absorbed) {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim_start(),
        _ => fragment,
    }
}

fn append_words(buffer: &mut String, words: &str) {
    let words = words.trim();
    if words.is_empty() {
        return;
    }
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(words);
}
