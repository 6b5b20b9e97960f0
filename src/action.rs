//! The single trust boundary between untrusted oracle output and the world.
//!
//! Anything the oracle proposes arrives here as loose JSON and leaves as a
//! typed [`Action`] or not at all. Conversational text additionally passes a
//! hard meta-content gate: a citizen never references models, servers, tests
//! or other out-of-world machinery, no matter how the oracle phrased it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::perception::NearbyBuilding;

/// Canonical action shapes the world server accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum Action {
    MoveTo {
        x: i64,
        y: i64,
    },
    EnterBuilding {
        building_id: String,
    },
    Speak {
        message: String,
    },
    StartConversation {
        target_id: String,
        message: String,
    },
    ConversationMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        message: String,
    },
    ApplyJob {
        job_id: String,
    },
    BuyProperty {
        property_id: String,
    },
    VoteJob {
        applicant_id: String,
        job_id: String,
    },
    Wait {},
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::MoveTo { .. } => "move_to",
            Action::EnterBuilding { .. } => "enter_building",
            Action::Speak { .. } => "speak",
            Action::StartConversation { .. } => "start_conversation",
            Action::ConversationMessage { .. } => "conversation_message",
            Action::ApplyJob { .. } => "apply_job",
            Action::BuyProperty { .. } => "buy_property",
            Action::VoteJob { .. } => "vote_job",
            Action::Wait {} => "wait",
        }
    }
}

/// Out-of-world vocabulary that must never appear in anything the citizen
/// says. Matched on word boundaries; stems cover inflected forms in both
/// languages heard around town.
const META_PATTERN: &str = r"(?i)\b(ia|llm|api|oauth|test|prueba|prompt|ciclo|sistema|servidor|modelo|estabilidad|monitoreo|secuencia|coordenad\w*|instrucci\w*|parametr\w*|parámetr\w*|diagnostic\w*|observaci\w*)\b";

/// True when a message breaks in-world immersion. Errs on the side of
/// rejection: non-string input is meta by definition.
pub fn is_meta_text(message: &str) -> bool {
    match regex_lite::Regex::new(META_PATTERN) {
        Ok(re) => re.is_match(message),
        // A broken filter must fail closed.
        Err(_) => true,
    }
}

/// Validate and coerce an arbitrary proposed action object into a canonical
/// [`Action`]. Returns `None` for anything malformed, unknown, or gated.
///
/// `buildings` lets a `move_to` proposal that names a building (rather than
/// coordinates) resolve against what the citizen currently perceives.
pub fn sanitize(proposal: &Value, buildings: &[NearbyBuilding]) -> Option<Action> {
    let action_type = proposal.get("type")?.as_str()?;
    let empty = Value::Object(Default::default());
    let params = match proposal.get("params") {
        Some(p @ Value::Object(_)) => p,
        _ => &empty,
    };

    match action_type {
        "move_to" => sanitize_move(params, buildings),
        "enter_building" => {
            let building_id = clean_id(params.get("building_id"))?;
            Some(Action::EnterBuilding { building_id })
        }
        "speak" => {
            let message = params.get("message")?.as_str()?.to_string();
            if is_meta_text(&message) {
                return None;
            }
            Some(Action::Speak { message })
        }
        "start_conversation" => {
            let target_id = clean_id(first_of(
                params,
                &["target_id", "targetId", "target", "to", "otherId"],
            ))?;
            let message = first_of(params, &["message", "text"])?.as_str()?.to_string();
            if is_meta_text(&message) {
                return None;
            }
            Some(Action::StartConversation { target_id, message })
        }
        "conversation_message" => {
            let message = first_of(params, &["message", "text"])?.as_str()?.to_string();
            if is_meta_text(&message) {
                return None;
            }
            let conversation_id = clean_id(first_of(params, &["conversation_id", "conversationId"]));
            let target_id = clean_id(first_of(
                params,
                &["target_id", "targetId", "target", "to", "otherId"],
            ));
            if conversation_id.is_none() && target_id.is_none() {
                return None;
            }
            Some(Action::ConversationMessage {
                conversation_id,
                target_id,
                message,
            })
        }
        "apply_job" => {
            let job_id = clean_id(first_of(params, &["job_id", "jobId"]))?;
            Some(Action::ApplyJob { job_id })
        }
        "buy_property" => {
            let property_id = clean_id(first_of(params, &["property_id", "propertyId"]))?;
            Some(Action::BuyProperty { property_id })
        }
        "vote_job" => {
            let applicant_id = clean_id(first_of(params, &["applicant_id", "applicantId"]))?;
            let job_id = clean_id(first_of(params, &["job_id", "jobId"]))?;
            Some(Action::VoteJob {
                applicant_id,
                job_id,
            })
        }
        "wait" => Some(Action::Wait {}),
        _ => None,
    }
}

fn sanitize_move(params: &Value, buildings: &[NearbyBuilding]) -> Option<Action> {
    // Direct coordinates.
    if let (Some(x), Some(y)) = (coerce_int(params.get("x")), coerce_int(params.get("y"))) {
        return Some(Action::MoveTo { x, y });
    }

    // Nested position objects the oracle sometimes invents.
    for key in ["position", "targetPosition"] {
        if let Some(nested) = params.get(key) {
            if let (Some(x), Some(y)) = (coerce_int(nested.get("x")), coerce_int(nested.get("y"))) {
                return Some(Action::MoveTo { x, y });
            }
        }
    }

    // targetX / targetY synonyms.
    if let (Some(x), Some(y)) = (
        coerce_int(params.get("targetX")),
        coerce_int(params.get("targetY")),
    ) {
        return Some(Action::MoveTo { x, y });
    }

    // A building id or name instead of coordinates.
    let target = clean_id(first_of(params, &["targetId", "target"]))?;
    let lowered = target.to_lowercase();
    let building = buildings
        .iter()
        .find(|b| b.id == lowered || b.name.to_lowercase() == lowered)?;
    let point = building.position?;
    Some(Action::MoveTo {
        x: point.x,
        y: point.y,
    })
}

fn first_of<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| {
        let v = params.get(k)?;
        if v.is_null() {
            None
        } else {
            Some(v)
        }
    })
}

fn coerce_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

fn clean_id(value: Option<&Value>) -> Option<String> {
    let trimmed = value?.as_str()?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
