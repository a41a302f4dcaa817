use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Severity bands. Exact boundaries are policy, not protocol: a fresh
/// `(severity, risk_score)` pair is derived on every evaluation — there is
/// no stored severity state machine.
pub const LOW_BAND_MAX: i32 = 30;
pub const MEDIUM_BAND_MAX: i32 = 70;
pub const MAX_RISK_SCORE: i32 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CrisisSeverity {
    Low,
    Medium,
    High,
}

impl CrisisSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrisisSeverity::Low => "low",
            CrisisSeverity::Medium => "medium",
            CrisisSeverity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(CrisisSeverity::Low),
            "medium" => Some(CrisisSeverity::Medium),
            "high" => Some(CrisisSeverity::High),
            _ => None,
        }
    }

    /// Map a 0–100 risk score into its severity band.
    pub fn for_score(score: i32) -> Self {
        if score <= LOW_BAND_MAX {
            CrisisSeverity::Low
        } else if score <= MEDIUM_BAND_MAX {
            CrisisSeverity::Medium
        } else {
            CrisisSeverity::High
        }
    }
}

/// Result of one classifier evaluation over the current transcript window.
#[derive(Debug, Clone, Copy, Serialize, ToSchema, PartialEq, Eq)]
pub struct RiskAssessment {
    pub severity: CrisisSeverity,
    pub risk_score: i32,
}

impl RiskAssessment {
    pub fn from_score(score: i32) -> Self {
        let risk_score = score.clamp(0, MAX_RISK_SCORE);
        Self {
            severity: CrisisSeverity::for_score(risk_score),
            risk_score,
        }
    }
}

/// A distress signal phrase and the score it contributes when matched.
struct Signal {
    phrase: &'static str,
    weight: i32,
}

/// Explicit self-harm intent. Any single match lands in the high band.
const HIGH_SIGNALS: &[Signal] = &[
    Signal { phrase: "kill myself", weight: 85 },
    Signal { phrase: "end my life", weight: 85 },
    Signal { phrase: "suicide", weight: 80 },
    Signal { phrase: "want to die", weight: 80 },
    Signal { phrase: "better off dead", weight: 78 },
    Signal { phrase: "no reason to live", weight: 75 },
    Signal { phrase: "hurt myself", weight: 72 },
    Signal { phrase: "self-harm", weight: 72 },
];

/// Hopelessness and entrapment language.
const MEDIUM_SIGNALS: &[Signal] = &[
    Signal { phrase: "hopeless", weight: 45 },
    Signal { phrase: "can't go on", weight: 45 },
    Signal { phrase: "no way out", weight: 42 },
    Signal { phrase: "worthless", weight: 40 },
    Signal { phrase: "give up on everything", weight: 40 },
    Signal { phrase: "trapped", weight: 35 },
];

/// General distress.
const LOW_SIGNALS: &[Signal] = &[
    Signal { phrase: "overwhelmed", weight: 18 },
    Signal { phrase: "panic", weight: 16 },
    Signal { phrase: "so alone", weight: 15 },
    Signal { phrase: "exhausted", weight: 12 },
    Signal { phrase: "scared", weight: 12 },
    Signal { phrase: "anxious", weight: 10 },
];

/// Classify the recent transcript window. Pure: the same window always
/// produces the same assessment. Returns None when no distress signal is
/// present — silence is not a low-severity crisis.
///
/// Scoring: the strongest matched signal sets the base; each additional
/// distinct match adds 5, clamped to 100.
pub fn assess_transcript<S: AsRef<str>>(window: &[S]) -> Option<RiskAssessment> {
    let mut strongest = 0;
    let mut matches = 0;

    for entry in window {
        let text = entry.as_ref().to_lowercase();
        for signal in HIGH_SIGNALS
            .iter()
            .chain(MEDIUM_SIGNALS)
            .chain(LOW_SIGNALS)
        {
            if text.contains(signal.phrase) {
                matches += 1;
                strongest = strongest.max(signal.weight);
            }
        }
    }

    if matches == 0 {
        return None;
    }

    let score = strongest + (matches - 1) * 5;
    Some(RiskAssessment::from_score(score))
}

/// Structured hotline data carried by `session:crisis-emergency` events and
/// the emergency-resources message.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmergencyResource {
    pub name: String,
    pub contact: String,
    pub description: String,
}

pub fn emergency_resources() -> Vec<EmergencyResource> {
    vec![
        EmergencyResource {
            name: "988 Suicide & Crisis Lifeline".to_string(),
            contact: "988".to_string(),
            description: "24/7 call or text support".to_string(),
        },
        EmergencyResource {
            name: "Crisis Text Line".to_string(),
            contact: "Text HOME to 741741".to_string(),
            description: "24/7 text-based crisis support".to_string(),
        },
        EmergencyResource {
            name: "Emergency services".to_string(),
            contact: "911".to_string(),
            description: "Immediate danger to yourself or others".to_string(),
        },
    ]
}

/// Intervention text shown to the end user, keyed by the session
/// configuration's language. Unknown languages fall back to English.
pub fn self_help_message(language: &str) -> &'static str {
    match language {
        "es" => {
            "Parece que este momento es difícil. Una técnica que puede ayudar: \
             respira lentamente — inhala contando hasta 4, sostén 4, exhala 4. \
             Estoy aquí contigo."
        }
        _ => {
            "It sounds like this moment is heavy. One technique that can help: \
             slow your breathing — in for a count of 4, hold for 4, out for 4. \
             I'm here with you."
        }
    }
}

pub fn check_in_message(language: &str) -> &'static str {
    match language {
        "es" => {
            "Lo que estás sintiendo es real y importa. ¿Quieres contarme más \
             sobre lo que está pasando ahora mismo? No tienes que pasar por \
             esto en soledad."
        }
        _ => {
            "What you're feeling is real and it matters. Would you like to tell \
             me more about what's going on right now? You don't have to carry \
             this alone."
        }
    }
}

pub fn emergency_message(language: &str) -> &'static str {
    match language {
        "es" => {
            "Me importa tu seguridad ahora mismo. Hay personas disponibles en \
             este momento: llama o envía un mensaje al 988, o escribe HOME al \
             741741. Si estás en peligro inmediato, llama al 911."
        }
        _ => {
            "I care about your safety right now. People are available this \
             minute: call or text 988, or text HOME to 741741. If you are in \
             immediate danger, call 911."
        }
    }
}

/// Behavioral guidance injected into the upstream-AI channel at the medium
/// tier. Hidden from the end user.
pub const MEDIUM_TIER_GUIDANCE: &str =
    "The user is showing signs of significant emotional distress. Slow the \
     conversation down. Validate their feelings before anything else, ask \
     open questions, and do not offer solutions unless asked. Avoid \
     minimizing language.";

/// De-escalation and referral guidance injected at the high tier. Hidden
/// from the end user.
pub const HIGH_TIER_GUIDANCE: &str =
    "The user may be at acute risk of self-harm. Prioritize de-escalation: \
     stay calm and present, acknowledge their pain directly, and gently and \
     repeatedly point to the crisis resources that were shared (988, Crisis \
     Text Line). Encourage them to reach out to someone they trust. Do not \
     end the conversation abruptly. A human supervisor has been alerted.";

/// Append-only audit record of a fired intervention. Never mutated after
/// insert.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InterventionAction {
    pub id: Uuid,
    pub session_id: String,
    pub tier: CrisisSeverity,
    /// What fired: "self_help_prompt", "supervisor_review", "emergency_alert",
    /// "manual_flag", "manual_unflag"
    pub action: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of one classifier detection.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CrisisEvent {
    pub id: Uuid,
    pub session_id: String,
    pub severity: CrisisSeverity,
    pub risk_score: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Acknowledged,
}

impl HandoffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Pending => "pending",
            HandoffStatus::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(HandoffStatus::Pending),
            "acknowledged" => Some(HandoffStatus::Acknowledged),
            _ => None,
        }
    }
}

/// Escalation surfacing a session for direct human intervention. Created at
/// the high tier; acknowledged by supervisory staff.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HumanHandoff {
    pub id: Uuid,
    pub session_id: String,
    pub status: HandoffStatus,
    pub risk_score: i32,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<Uuid>,
}

/// Request body for manual supervisor flagging.
#[derive(Debug, Deserialize, ToSchema)]
pub struct FlagSessionRequest {
    pub severity: CrisisSeverity,
    #[serde(default)]
    pub risk_score: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{
        CrisisSeverity, LOW_BAND_MAX, MEDIUM_BAND_MAX, RiskAssessment, assess_transcript,
        emergency_message, emergency_resources, self_help_message,
    };

    #[test]
    fn score_bands_are_disjoint_and_cover_the_range() {
        assert_eq!(CrisisSeverity::for_score(0), CrisisSeverity::Low);
        assert_eq!(CrisisSeverity::for_score(LOW_BAND_MAX), CrisisSeverity::Low);
        assert_eq!(
            CrisisSeverity::for_score(LOW_BAND_MAX + 1),
            CrisisSeverity::Medium
        );
        assert_eq!(
            CrisisSeverity::for_score(MEDIUM_BAND_MAX),
            CrisisSeverity::Medium
        );
        assert_eq!(
            CrisisSeverity::for_score(MEDIUM_BAND_MAX + 1),
            CrisisSeverity::High
        );
        assert_eq!(CrisisSeverity::for_score(100), CrisisSeverity::High);
    }

    #[test]
    fn score_of_85_always_selects_high() {
        let assessment = RiskAssessment::from_score(85);
        assert_eq!(assessment.severity, CrisisSeverity::High);
        assert_eq!(assessment.risk_score, 85);
    }

    #[test]
    fn scores_clamp_to_valid_range() {
        assert_eq!(RiskAssessment::from_score(250).risk_score, 100);
        assert_eq!(RiskAssessment::from_score(-5).risk_score, 0);
    }

    #[test]
    fn explicit_intent_classifies_high() {
        let window = ["I think I want to end my life tonight"];
        let assessment = assess_transcript(&window).unwrap();
        assert_eq!(assessment.severity, CrisisSeverity::High);
    }

    #[test]
    fn hopelessness_classifies_medium() {
        let window = ["everything feels hopeless lately"];
        let assessment = assess_transcript(&window).unwrap();
        assert_eq!(assessment.severity, CrisisSeverity::Medium);
    }

    #[test]
    fn mild_distress_classifies_low() {
        let window = ["I'm feeling pretty anxious about tomorrow"];
        let assessment = assess_transcript(&window).unwrap();
        assert_eq!(assessment.severity, CrisisSeverity::Low);
    }

    #[test]
    fn neutral_content_produces_no_assessment() {
        let window = ["what a nice day", "tell me about gardening"];
        assert!(assess_transcript(&window).is_none());
    }

    #[test]
    fn classifier_is_pure() {
        let window = ["I feel trapped and hopeless", "there's no way out"];
        let first = assess_transcript(&window).unwrap();
        let second = assess_transcript(&window).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let window = ["I FEEL HOPELESS"];
        assert!(assess_transcript(&window).is_some());
    }

    #[test]
    fn emergency_payload_includes_hotlines() {
        let resources = emergency_resources();
        assert!(resources.iter().any(|r| r.contact == "988"));
        assert!(resources.iter().any(|r| r.contact.contains("741741")));
    }

    #[test]
    fn intervention_text_falls_back_to_english() {
        assert_eq!(self_help_message("fr"), self_help_message("en"));
        assert_ne!(emergency_message("es"), emergency_message("en"));
    }
}
