//! Who the trainee is calling, and how hard the prospect makes it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The simulated prospect's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    /// Gatekeeper screening calls for a manager.
    Secretary,
    /// Operational manager with little time.
    Manager,
    /// Executive decision maker.
    Director,
}

impl Persona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Secretary => "secretary",
            Persona::Manager => "manager",
            Persona::Director => "director",
        }
    }

    /// Role description used in the prospect's system prompt.
    pub fn prompt(&self) -> &'static str {
        match self {
            Persona::Secretary => {
                "Tu es la secrétaire d'une PME française. Tu filtres les appels pour ton responsable : \
                 tu demandes qui appelle, de quelle société et pour quel motif avant de transférer."
            }
            Persona::Manager => {
                "Tu es responsable d'équipe dans une entreprise française. Tu es occupé, tu veux \
                 comprendre rapidement ce qu'on te propose et ce que ça change pour ton équipe."
            }
            Persona::Director => {
                "Tu es directeur général d'une entreprise française. Tu raisonnes en retour sur \
                 investissement, tu coupes court aux discours génériques et tu exiges des chiffres."
            }
        }
    }
}

/// How resistant the prospect is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn prompt(&self) -> &'static str {
        match self {
            Difficulty::Easy => {
                "Tu es plutôt ouvert. Tu poses une ou deux questions simples et tu acceptes un \
                 rendez-vous si l'interlocuteur est clair et poli."
            }
            Difficulty::Medium => {
                "Tu es réservé. Tu soulèves au moins une objection (pas le temps, déjà un fournisseur) \
                 et tu n'acceptes que si elle est bien traitée."
            }
            Difficulty::Hard => {
                "Tu es pressé et sceptique. Tu enchaînes les objections, tu coupes court aux \
                 banalités et tu raccroches si l'interlocuteur reste vague."
            }
        }
    }
}

macro_rules! impl_text_enum {
    ($ty:ty, $name:literal, [$($variant:expr),+]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|v: &$ty| v.as_str() == wanted)
                    .ok_or_else(|| format!("unknown {} '{}'", $name, s))
            }
        }
    };
}

impl_text_enum!(Persona, "persona", [Persona::Secretary, Persona::Manager, Persona::Director]);
impl_text_enum!(Difficulty, "difficulty", [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard]);

/// The training configuration a call is created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub persona: Persona,
    pub difficulty: Difficulty,
}

impl TrainingConfig {
    pub fn new(persona: Persona, difficulty: Difficulty) -> Self {
        Self { persona, difficulty }
    }

    /// System prompt for the simulated prospect.
    pub fn system_prompt(&self) -> String {
        format!(
            "{}\n{}\n\
             Tu réponds au téléphone, en français, en une ou deux phrases courtes et naturelles, \
             sans didascalies ni emojis. Tu ne révèles jamais que tu es une IA. \
             Quand la conversation est terminée (rendez-vous fixé, refus définitif ou raccrochage), \
             termine ta réponse par {}.",
            self.persona.prompt(),
            self.difficulty.prompt(),
            crate::generation::END_CALL_MARKER,
        )
    }
}
