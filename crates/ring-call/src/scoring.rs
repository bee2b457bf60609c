//! **Scoring** — turning a finished call into feedback for the trainee.
//!
//! The scoring collaborator may fail or time out; [`fallback_score`] is the
//! deterministic answer used in that case, so a call always ends with a result.

use crate::chat::{ChatClient, ChatMessage};
use crate::error::{CallError, CallResult};
use crate::persona::TrainingConfig;
use crate::transcript::{Speaker, Transcript};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Score breakdown for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    /// Overall score, 0..=100.
    pub score: u8,
    pub strengths: Vec<String>,
    pub recommendations: Vec<String>,
    pub improvements: Vec<String>,
    /// Per-criterion scores (0..=100), e.g. `introduction`, `objections`.
    #[serde(default)]
    pub detailed_breakdown: BTreeMap<String, u8>,
}

/// Scoring collaborator.
#[async_trait]
pub trait CallScorer: Send + Sync {
    async fn score_call(
        &self,
        transcript: &Transcript,
        training: &TrainingConfig,
        duration: Duration,
    ) -> CallResult<ScoreReport>;
}

/// Deterministic score from user-turn count and word count: low for empty or
/// very short exchanges, moderate for longer ones. Never above 75.
pub fn fallback_score(transcript: &Transcript, duration: Duration) -> ScoreReport {
    let turns = transcript.user_turns().count() as u32;
    let words = transcript.user_word_count() as u32;

    let score = (if turns == 0 {
        10
    } else if words < 20 {
        (20 + 5 * turns).min(35)
    } else {
        (40 + (5 * turns).min(20) + (words / 10).min(15)).min(75)
    }) as u8;

    let mut strengths = Vec::new();
    let mut recommendations = Vec::new();
    let mut improvements = Vec::new();

    if turns == 0 {
        recommendations.push(
            "Présentez-vous dès que le prospect décroche : prénom, société, motif de l'appel."
                .to_string(),
        );
        improvements.push("Aucune prise de parole n'a été détectée pendant l'appel.".to_string());
    } else {
        strengths.push(format!(
            "Vous avez tenu {} échange{} avec le prospect.",
            turns,
            if turns > 1 { "s" } else { "" }
        ));
        if words < 20 {
            recommendations.push(
                "Développez vos réponses : expliquez la valeur de votre offre en une ou deux phrases."
                    .to_string(),
            );
            improvements.push("Vos interventions sont restées très courtes.".to_string());
        } else {
            recommendations.push(
                "Terminez par une proposition concrète de rendez-vous avec deux créneaux au choix."
                    .to_string(),
            );
        }
    }
    if duration < Duration::from_secs(30) {
        improvements.push("L'appel a duré moins de 30 secondes.".to_string());
    }
    recommendations.push(
        "L'analyse détaillée était indisponible : ce score est une estimation.".to_string(),
    );

    let mut detailed_breakdown = BTreeMap::new();
    detailed_breakdown.insert("engagement".to_string(), score);

    ScoreReport {
        score,
        strengths,
        recommendations,
        improvements,
        detailed_breakdown,
    }
}

/// Scorer that always answers with [`fallback_score`]. Use offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalScorer;

#[async_trait]
impl CallScorer for LocalScorer {
    async fn score_call(
        &self,
        transcript: &Transcript,
        _training: &TrainingConfig,
        duration: Duration,
    ) -> CallResult<ScoreReport> {
        Ok(fallback_score(transcript, duration))
    }
}

// Models return scores as floats, sometimes out of range.
#[derive(Deserialize)]
struct RawReport {
    score: f64,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    improvements: Vec<String>,
    #[serde(default, alias = "detailedBreakdown")]
    detailed_breakdown: BTreeMap<String, f64>,
}

fn clamp_score(value: f64) -> u8 {
    if value.is_nan() {
        0
    } else {
        value.round().clamp(0.0, 100.0) as u8
    }
}

/// Parse a model's JSON verdict. Scores are clamped to 0..=100.
pub fn parse_report(raw: &str) -> CallResult<ScoreReport> {
    let parsed: RawReport = serde_json::from_str(raw.trim())?;
    let mut report = ScoreReport {
        score: clamp_score(parsed.score),
        strengths: parsed.strengths,
        recommendations: parsed.recommendations,
        improvements: parsed.improvements,
        detailed_breakdown: parsed
            .detailed_breakdown
            .into_iter()
            .map(|(k, v)| (k, clamp_score(v)))
            .collect(),
    };
    if report.recommendations.is_empty() {
        report
            .recommendations
            .push("Rejouez l'appel en variant votre accroche.".to_string());
    }
    Ok(report)
}

/// Production scorer: asks the model for a JSON evaluation of the call.
pub struct ChatCallScorer {
    client: ChatClient,
}

impl ChatCallScorer {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    fn prompt(transcript: &Transcript, training: &TrainingConfig, duration: Duration) -> String {
        let dialogue = transcript
            .turns()
            .iter()
            .map(|turn| {
                let who = match turn.speaker() {
                    Speaker::User => "Commercial",
                    Speaker::Assistant => "Prospect",
                };
                format!("{}: {}", who, turn.text())
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Évalue cet appel de prospection (prospect : {}, difficulté : {}, durée : {} s).\n\n{}\n\n\
             Réponds uniquement avec un objet JSON : {{\"score\": 0-100, \"strengths\": [..], \
             \"recommendations\": [..], \"improvements\": [..], \"detailed_breakdown\": \
             {{\"introduction\": 0-100, \"decouverte\": 0-100, \"objections\": 0-100, \"conclusion\": 0-100}}}}",
            training.persona,
            training.difficulty,
            duration.as_secs(),
            dialogue
        )
    }
}

#[async_trait]
impl CallScorer for ChatCallScorer {
    async fn score_call(
        &self,
        transcript: &Transcript,
        training: &TrainingConfig,
        duration: Duration,
    ) -> CallResult<ScoreReport> {
        let messages = [
            ChatMessage::system(
                "Tu es un coach commercial exigeant qui évalue des appels à froid en français.",
            ),
            ChatMessage::user(Self::prompt(transcript, training, duration)),
        ];
        let raw = self.client.complete(&messages, 0.2, true).await?;
        let report = parse_report(&raw).map_err(|e| CallError::Scoring(e.to_string()))?;
        debug!(score = report.score, "call scored");
        Ok(report)
    }
}
