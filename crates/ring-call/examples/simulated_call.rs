//! Simulated call: one complete cold call without a microphone.
//!
//! The trainee's lines are typed into a scripted recognizer; the prospect is
//! played by the chat API if `RING_LLM_API_KEY` (or `OPENAI_API_KEY`) is set,
//! otherwise by a canned script. Audio is simulated.
//!
//! ```text
//! cargo run -p ring-call --example simulated_call -- secretary medium
//! ```

use ring_call::{
    CallCollaborators, CallConfig, CallScorer, CallState, ChatCallScorer, ChatClient,
    ChatReplyGenerator, Difficulty, LocalScorer, Persona, PhoneCall, ReplyGenerator,
    ScriptedRecognizer, ScriptedReply, ScriptedReplyGenerator, SimulatedPlayer, TrainingConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TRAINEE_LINES: &[&str] = &[
    "Bonjour, je suis Marc de la société Flotteo.",
    "Je vous appelle au sujet de la gestion de votre flotte de véhicules.",
    "Je comprends, justement avec nous vos coûts de carburant baissent de quinze pour cent.",
    "Est-ce que jeudi à dix heures vous conviendrait pour en parler ?",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ring_call=debug,simulated_call=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let persona: Persona = args.next().as_deref().unwrap_or("secretary").parse()?;
    let difficulty: Difficulty = args.next().as_deref().unwrap_or("easy").parse()?;
    let training = TrainingConfig::new(persona, difficulty);
    let config = CallConfig::load()?;

    let (generator, scorer): (Arc<dyn ReplyGenerator>, Arc<dyn CallScorer>) =
        match ChatClient::from_env() {
            Ok(client) => {
                info!("Prospect played by the chat API");
                (
                    Arc::new(ChatReplyGenerator::new(client.clone(), training)),
                    Arc::new(ChatCallScorer::new(client)),
                )
            }
            Err(e) => {
                warn!(error = %e, "no chat API configured; using the canned prospect");
                (
                    Arc::new(ScriptedReplyGenerator::new([
                        ScriptedReply::say("Allô, oui ?"),
                        ScriptedReply::say("Oui, c'est à quel sujet ?").after(Duration::from_millis(800)),
                        ScriptedReply::say("Nous avons déjà un prestataire pour ça.")
                            .after(Duration::from_millis(800)),
                        ScriptedReply::say("Ah, quand même. Dites-m'en plus.").after(Duration::from_millis(800)),
                        ScriptedReply::say_and_hang_up("Jeudi dix heures, c'est noté. Au revoir.")
                            .after(Duration::from_millis(800)),
                    ])),
                    Arc::new(LocalScorer),
                )
            }
        };

    let (recognizer, probe) = ScriptedRecognizer::new();
    let mut call = PhoneCall::start(
        training,
        config,
        CallCollaborators {
            recognizer: Box::new(recognizer),
            generator,
            scorer,
            player: Arc::new(SimulatedPlayer::new(Duration::from_secs(3))),
        },
    );
    info!(session = %call.session_id(), %persona, %difficulty, "Calling...");

    call.wait_for_state(CallState::Connected).await?;
    let mut state = call.watch_state();
    for line in TRAINEE_LINES {
        tokio::time::sleep(Duration::from_secs(6)).await;
        if *state.borrow_and_update() == CallState::Ended {
            break;
        }
        info!("🎤 {}", line);
        probe.say_final(line);
    }

    tokio::time::sleep(Duration::from_secs(6)).await;
    if call.state() != CallState::Ended {
        call.hang_up()?;
    }
    let result = call.finish().await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
