//! Integration tests for complete simulated calls
//!
//! Every collaborator is scripted and tokio time is paused, so these run
//! without audio hardware or network access.

use async_trait::async_trait;
use ring_call::{
    AudioClip, CallCollaborators, CallConfig, CallError, CallHandle, CallResult, CallScorer,
    CallState, Difficulty, EndReason, LocalScorer, MicrophoneErrorKind, Persona,
    RecognitionEvent, RecognizerProbe, ScoreReport, ScriptedRecognizer, ScriptedReply,
    ScriptedReplyGenerator, SimulatedPlayer, Speaker, TrainingConfig, Transcript,
    TransportState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const RINGTONE: Duration = Duration::from_secs(2);
const INTRODUCTION: &str =
    "Bonjour, je suis Marc de la société X, j'aimerais vous proposer un rendez-vous.";

struct UnavailableScorer;

#[async_trait]
impl CallScorer for UnavailableScorer {
    async fn score_call(
        &self,
        _transcript: &Transcript,
        _training: &TrainingConfig,
        _duration: Duration,
    ) -> CallResult<ScoreReport> {
        Err(CallError::Scoring("scoring service unavailable".to_string()))
    }
}

struct StalledScorer;

#[async_trait]
impl CallScorer for StalledScorer {
    async fn score_call(
        &self,
        _transcript: &Transcript,
        _training: &TrainingConfig,
        _duration: Duration,
    ) -> CallResult<ScoreReport> {
        std::future::pending().await
    }
}

struct Harness {
    handle: CallHandle,
    probe: RecognizerProbe,
    generator: ScriptedReplyGenerator,
    player: Arc<SimulatedPlayer>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn place_call_with(
    replies: Vec<ScriptedReply>,
    scorer: Arc<dyn CallScorer>,
    config: CallConfig,
    probe_setup: impl FnOnce(&RecognizerProbe),
) -> Harness {
    init_tracing();
    let (recognizer, probe) = ScriptedRecognizer::new();
    probe_setup(&probe);
    let generator = ScriptedReplyGenerator::new(replies);
    let player = Arc::new(SimulatedPlayer::new(RINGTONE));

    let handle = ring_call::PhoneCall::start(
        TrainingConfig::new(Persona::Secretary, Difficulty::Easy),
        config,
        CallCollaborators {
            recognizer: Box::new(recognizer),
            generator: Arc::new(generator.clone()),
            scorer,
            player: player.clone(),
        },
    );
    Harness {
        handle,
        probe,
        generator,
        player,
    }
}

fn place_call(replies: Vec<ScriptedReply>) -> Harness {
    place_call_with(replies, Arc::new(LocalScorer), CallConfig::default(), |_| {})
}

#[tokio::test(start_paused = true)]
async fn test_secretary_call_end_to_end() {
    let mut call = place_call(vec![
        ScriptedReply::say("Allô ?"),
        ScriptedReply::say("C'est à quel sujet exactement ?"),
    ]);

    call.handle
        .wait_for_state(CallState::Connected)
        .await
        .expect("Call never connected");
    let connected_at = Instant::now();

    // Let the opening line finish, then introduce ourselves in one go.
    sleep(Duration::from_secs(1)).await;
    assert!(call.probe.say_final(INTRODUCTION));
    sleep(Duration::from_secs(4)).await;

    call.handle.hang_up().expect("Failed to hang up");
    let hung_up_at = Instant::now();
    let result = call.handle.finish().await.expect("Call task failed");

    assert_eq!(
        result.states(),
        vec![
            CallState::Dialing,
            CallState::Ringing,
            CallState::Connected,
            CallState::Ended
        ]
    );
    assert_eq!(result.end_reason, EndReason::UserHangUp);

    let turns = result.transcript.turns();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0].speaker(), Speaker::Assistant);
    assert_eq!(turns[0].text(), "Allô ?");
    assert_eq!(turns[1].speaker(), Speaker::User);
    assert_eq!(turns[1].text(), INTRODUCTION);
    assert_eq!(turns[2].speaker(), Speaker::Assistant);
    assert!(result.transcript.is_frozen());

    let wall_clock = hung_up_at - connected_at;
    let drift = if result.duration > wall_clock {
        result.duration - wall_clock
    } else {
        wall_clock - result.duration
    };
    assert!(drift <= Duration::from_secs(1), "duration drifted by {:?}", drift);

    let calls = call.generator.calls();
    assert!(calls[0].is_first_turn);
    assert_eq!(calls[1].history.len(), 2);
    assert!(!result.scored_by_fallback);
    assert!(result.score <= 100);
}

#[tokio::test(start_paused = true)]
async fn test_speech_during_playback_is_flushed_as_one_turn() {
    let call = place_call(vec![
        ScriptedReply::say("Allô, j'écoute ?").with_audio(AudioClip::silent(Duration::from_secs(3))),
        ScriptedReply::say("Oui, c'est à quel sujet ?"),
    ]);

    sleep(RINGTONE + Duration::from_millis(500)).await;
    assert!(call.probe.say_final("Bonjour"));
    assert!(call.probe.say_final("je suis Marc de la société Dupont"));
    sleep(Duration::from_millis(500)).await;
    assert_eq!(call.generator.call_count(), 1, "nothing may be submitted while the prospect speaks");

    sleep(Duration::from_secs(3)).await;
    assert_eq!(call.generator.call_count(), 2);

    call.handle.hang_up().expect("Failed to hang up");
    let result = call.handle.finish().await.expect("Call task failed");
    let user_turns: Vec<_> = result.transcript.user_turns().collect();
    assert_eq!(user_turns.len(), 1);
    assert_eq!(user_turns[0].text(), "Bonjour je suis Marc de la société Dupont");
}

#[tokio::test(start_paused = true)]
async fn test_repeated_recognition_yields_single_turn() {
    let call = place_call(vec![
        ScriptedReply::say("Allô ?"),
        ScriptedReply::say("Oui ?").after(Duration::from_millis(500)),
    ]);

    sleep(RINGTONE + Duration::from_secs(1)).await;
    assert!(call.probe.say_final(INTRODUCTION));
    assert!(call.probe.say_final(INTRODUCTION));
    sleep(Duration::from_secs(4)).await;

    call.handle.hang_up().expect("Failed to hang up");
    let result = call.handle.finish().await.expect("Call task failed");

    assert_eq!(result.transcript.user_turns().count(), 1);
    assert_eq!(call.generator.call_count(), 2);
    let speakers: Vec<_> = result.transcript.turns().iter().map(|t| t.speaker()).collect();
    assert_eq!(
        speakers,
        vec![Speaker::Assistant, Speaker::User, Speaker::Assistant]
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_recognizer_restart_while_prospect_speaks() {
    let call = place_call(vec![
        ScriptedReply::say("Allô ?"),
        ScriptedReply::say("Écoutez, je vais vous expliquer comment ça se passe chez nous.")
            .with_audio(AudioClip::silent(Duration::from_secs(5))),
    ]);

    sleep(RINGTONE + Duration::from_secs(1)).await;
    assert!(call.probe.say_final(INTRODUCTION));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(call.probe.start_count(), 1);

    let engine = call.probe.sender().expect("Recognizer should be running");
    for _ in 0..5 {
        engine
            .send(RecognitionEvent::Terminated {
                reason: "no-speech".to_string(),
            })
            .expect("Recognition channel closed");
        sleep(Duration::from_millis(400)).await;
    }
    assert_eq!(call.probe.start_count(), 1, "restart attempted while prospect speaks");

    sleep(Duration::from_secs(4)).await;
    assert_eq!(call.probe.start_count(), 2);

    call.handle.hang_up().expect("Failed to hang up");
    call.handle.finish().await.expect("Call task failed");
}

#[tokio::test(start_paused = true)]
async fn test_recognizer_restarts_after_silence_timeout() {
    let call = place_call(vec![ScriptedReply::say("Allô ?")]);

    sleep(RINGTONE + Duration::from_secs(1)).await;
    assert!(call.probe.terminate("no-speech"));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(call.probe.start_count(), 2);
    assert!(call.probe.say_final(INTRODUCTION));

    call.handle.hang_up().expect("Failed to hang up");
    call.handle.finish().await.expect("Call task failed");
}

#[tokio::test(start_paused = true)]
async fn test_prospect_ends_the_call() {
    let call = place_call(vec![
        ScriptedReply::say("Allô ?"),
        ScriptedReply::say_and_hang_up("Non merci, ça ne nous intéresse pas. Au revoir."),
    ]);

    sleep(RINGTONE + Duration::from_secs(1)).await;
    assert!(call.probe.say_final(INTRODUCTION));

    let result = call.handle.finish().await.expect("Call task failed");
    assert_eq!(result.end_reason, EndReason::ProspectHungUp);
    assert_eq!(
        result.transcript.last().map(|t| t.text()),
        Some("Non merci, ça ne nous intéresse pas. Au revoir.")
    );
    assert!(call.player.stop_count() >= 1);
    assert!(!call.probe.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_microphone_permission_denied_ends_call() {
    let call = place_call_with(
        vec![ScriptedReply::say("Allô ?")],
        Arc::new(LocalScorer),
        CallConfig::default(),
        |probe| probe.fail_next_start(MicrophoneErrorKind::PermissionDenied),
    );

    let result = call.handle.finish().await.expect("Call task failed");
    assert_eq!(result.end_reason, EndReason::Fault);
    assert_eq!(result.states().last(), Some(&CallState::Ended));
    assert_eq!(
        result.user_message.as_deref(),
        Some(MicrophoneErrorKind::PermissionDenied.user_message())
    );
    assert!(result.error.is_some());
    assert_eq!(result.transcript.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_device_loss_mid_call_keeps_partial_transcript() {
    let call = place_call(vec![ScriptedReply::say("Allô ?"), ScriptedReply::say("Oui ?")]);

    sleep(RINGTONE + Duration::from_secs(1)).await;
    assert!(call.probe.say_final(INTRODUCTION));
    sleep(Duration::from_secs(2)).await;
    assert!(call
        .probe
        .device_error(MicrophoneErrorKind::NoDevice, "device unplugged"));

    let result = call.handle.finish().await.expect("Call task failed");
    assert_eq!(result.end_reason, EndReason::Fault);
    assert_eq!(result.transcript.len(), 3);
    assert!(result.user_message.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_is_fatal_but_disconnect_is_not() {
    let call = place_call(vec![ScriptedReply::say("Allô ?")]);

    sleep(RINGTONE + Duration::from_secs(1)).await;
    assert!(call.probe.transport(TransportState::Disconnected));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(call.handle.state(), CallState::Connected);
    assert_eq!(call.probe.start_count(), 2);

    assert!(call.probe.transport(TransportState::Error));
    let result = call.handle.finish().await.expect("Call task failed");
    assert_eq!(result.end_reason, EndReason::Fault);
    assert!(result.error.unwrap().contains("Transport"));
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_while_ringing_uses_fallback_score() {
    let call = place_call_with(
        vec![ScriptedReply::say("Allô ?")],
        Arc::new(UnavailableScorer),
        CallConfig::default(),
        |_| {},
    );

    sleep(Duration::from_millis(500)).await;
    assert_eq!(call.handle.state(), CallState::Ringing);
    call.handle.hang_up().expect("Failed to hang up");

    let result = call.handle.finish().await.expect("Call task failed");
    assert_eq!(
        result.states(),
        vec![CallState::Dialing, CallState::Ringing, CallState::Ended]
    );
    assert!(result.transcript.is_empty());
    assert_eq!(result.duration, Duration::ZERO);
    assert!(result.scored_by_fallback);
    assert!(result.score <= 100);
    assert!(!result.recommendations.is_empty());
    assert_eq!(call.probe.start_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_generation_failures_fall_back_then_end_call() {
    let call = place_call(vec![
        ScriptedReply::say("Allô ?"),
        ScriptedReply::fail("upstream 503"),
        ScriptedReply::fail("upstream 503"),
        ScriptedReply::fail("upstream 503"),
    ]);

    sleep(RINGTONE + Duration::from_secs(1)).await;
    for line in [
        INTRODUCTION,
        "Je vous appelle au sujet de votre flotte de véhicules.",
        "Est-ce que vous avez deux minutes à m'accorder ?",
    ] {
        assert!(call.probe.say_final(line));
        sleep(Duration::from_secs(2)).await;
    }

    let result = call.handle.finish().await.expect("Call task failed");
    assert_eq!(result.end_reason, EndReason::GenerationUnavailable);
    assert!(result.error.is_some());

    let fallbacks = result
        .transcript
        .turns()
        .iter()
        .filter(|t| t.speaker() == Speaker::Assistant && t.text() == "Pardon ?")
        .count();
    assert_eq!(fallbacks, 3);
    assert_eq!(result.transcript.user_turns().count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_generation_times_out_to_fallback() {
    let mut config = CallConfig::default();
    config.dispatch.reply_timeout_ms = 2_000;
    let call = place_call_with(
        vec![ScriptedReply::say("Allô ?"), ScriptedReply::Stall],
        Arc::new(LocalScorer),
        config,
        |_| {},
    );

    sleep(RINGTONE + Duration::from_secs(1)).await;
    assert!(call.probe.say_final(INTRODUCTION));
    sleep(Duration::from_secs(3)).await;

    call.handle.hang_up().expect("Failed to hang up");
    let result = call.handle.finish().await.expect("Call task failed");
    assert_eq!(result.end_reason, EndReason::UserHangUp);
    assert_eq!(result.transcript.last().map(|t| t.text()), Some("Pardon ?"));
}

#[tokio::test(start_paused = true)]
async fn test_microphone_opens_after_opening_when_capture_disabled() {
    let mut config = CallConfig::default();
    config.listening.capture_during_opening = false;
    let mut call = place_call_with(
        vec![ScriptedReply::say("Allô ?").with_audio(AudioClip::silent(Duration::from_secs(2)))],
        Arc::new(LocalScorer),
        config,
        |_| {},
    );

    call.handle
        .wait_for_state(CallState::Connected)
        .await
        .expect("Call never connected");
    sleep(Duration::from_millis(500)).await;
    assert!(!call.probe.say_final("Bonjour"), "microphone open during the opening line");

    sleep(Duration::from_secs(2)).await;
    assert!(call.probe.is_running());

    call.handle.hang_up().expect("Failed to hang up");
    call.handle.finish().await.expect("Call task failed");
}

#[tokio::test(start_paused = true)]
async fn test_non_fatal_fault_does_not_end_call() {
    let mut call = place_call(vec![ScriptedReply::say("Allô ?")]);

    call.handle
        .wait_for_state(CallState::Connected)
        .await
        .expect("Call never connected");
    call.handle
        .report_fault(CallError::Playback("clip could not be decoded".to_string()))
        .expect("Failed to report fault");
    sleep(Duration::from_secs(1)).await;
    assert_eq!(call.handle.state(), CallState::Connected);

    call.handle
        .report_fault(CallError::microphone(MicrophoneErrorKind::Unknown, "stream closed"))
        .expect("Failed to report fault");
    let result = call.handle.finish().await.expect("Call task failed");
    assert_eq!(result.end_reason, EndReason::Fault);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_scorer_times_out_to_fallback_score() {
    let mut config = CallConfig::default();
    config.scoring.timeout_ms = 1_000;
    let mut call = place_call_with(
        vec![ScriptedReply::say("Allô ?")],
        Arc::new(StalledScorer),
        config,
        |_| {},
    );

    call.handle
        .wait_for_state(CallState::Connected)
        .await
        .expect("Call never connected");
    call.handle.hang_up().expect("Failed to hang up");

    let finished = Instant::now();
    let result = call.handle.finish().await.expect("Call task failed");
    assert!(finished.elapsed() >= Duration::from_secs(1));
    assert!(result.scored_by_fallback);
    assert_eq!(result.score, 10);
    assert!(!result.recommendations.is_empty());
    assert_eq!(result.end_reason, EndReason::UserHangUp);
}

#[tokio::test(start_paused = true)]
async fn test_speech_flushed_too_soon_is_retried_not_lost() {
    const FOLLOW_UP: &str = "Je vous appelle au sujet de votre flotte.";
    let call = place_call(vec![
        ScriptedReply::say("Allô ?"),
        ScriptedReply::say("Oui ?").with_audio(AudioClip::silent(Duration::from_millis(300))),
        ScriptedReply::say("D'accord, je vous écoute."),
    ]);

    sleep(RINGTONE + Duration::from_secs(1)).await;
    assert!(call.probe.say_final(INTRODUCTION));
    sleep(Duration::from_millis(100)).await;
    assert!(call.probe.say_final(FOLLOW_UP));

    // Playback is over but the minimum spacing has not elapsed yet.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(call.generator.call_count(), 2);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(call.generator.call_count(), 3);

    call.handle.hang_up().expect("Failed to hang up");
    let result = call.handle.finish().await.expect("Call task failed");
    let user_turns: Vec<_> = result.transcript.user_turns().map(|t| t.text()).collect();
    assert_eq!(user_turns, vec![INTRODUCTION, FOLLOW_UP]);
}

#[tokio::test(start_paused = true)]
async fn test_interim_tail_during_playback_joins_the_flushed_turn() {
    let call = place_call(vec![
        ScriptedReply::say("Allô, j'écoute ?").with_audio(AudioClip::silent(Duration::from_secs(3))),
        ScriptedReply::say("Oui, c'est à quel sujet ?"),
    ]);

    sleep(RINGTONE + Duration::from_millis(500)).await;
    assert!(call.probe.emit("Bonjour, je suis Marc", "de la société Dupont"));
    sleep(Duration::from_secs(3)).await;
    assert_eq!(call.generator.call_count(), 2);

    // The recognizer finalizes the words it had shown as interim.
    assert!(call.probe.say_final("de la société Dupont"));
    sleep(Duration::from_secs(3)).await;

    call.handle.hang_up().expect("Failed to hang up");
    let result = call.handle.finish().await.expect("Call task failed");
    let user_turns: Vec<_> = result.transcript.user_turns().map(|t| t.text()).collect();
    assert_eq!(user_turns, vec!["Bonjour, je suis Marc de la société Dupont"]);
    assert_eq!(call.generator.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_recognizer_that_never_restarts_ends_call() {
    let call = place_call(vec![ScriptedReply::say("Allô ?")]);

    sleep(RINGTONE + Duration::from_secs(1)).await;
    call.probe.fail_starts(usize::MAX);
    assert!(call.probe.terminate("network"));

    let terminated = Instant::now();
    let result = call.handle.finish().await.expect("Call task failed");
    assert_eq!(result.end_reason, EndReason::Fault);
    assert!(result
        .error
        .expect("Failure should be reported")
        .contains("Speech recognition"));
    // 300 + 600 + 1200 + 2400 + 4800 ms of backoff before giving up.
    assert!(terminated.elapsed() >= Duration::from_millis(9_300));
    assert_eq!(call.probe.start_attempts(), 6);
}
