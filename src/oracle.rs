//! Oracle client: the external proposal model behind an OpenAI-compatible
//! chat-completions endpoint. Every consumer of this module treats a failed
//! or unparseable completion as "no proposal", never as an error to
//! propagate.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::OracleConfig;
use crate::memory::RelationshipJudgment;

const PROPOSE_PROMPT: &str = "Eres un ciudadano de MOLTVILLE. Actúas solo dentro del mundo, en primera persona. \
    Nunca menciones IA, modelos, sistemas, pruebas, servidores ni infraestructura. \
    Usa relaciones, memoria y conversación previa si existen. \
    Tu respuesta debe AVANZAR el próximo paso del motivo actual (motivation.chain). \
    Si hay una conversación activa donde tú participas, RESPONDE con conversation_message. \
    Si no hay conversación y ves a alguien cerca, inicia start_conversation. \
    Si estás solo, muévete hacia un lugar relevante según tu intención. \
    No repitas mensajes recientes. \
    Devuelve SOLO JSON válido con la acción a ejecutar. \
    Formato: {\"type\": \"move_to|enter_building|speak|apply_job|buy_property|vote_job|wait|start_conversation|conversation_message\", \"params\": { ... } }.";

const FORCED_REPLY_PROMPT: &str = "Hay una conversación activa. Debes responder SOLO con conversation_message. \
    No uses move_to, enter_building, speak, apply_job, buy_property, vote_job ni start_conversation. \
    Mantente 100% in-world. Responde con un solo mensaje natural. \
    Si ves forcedConversationId úsalo como conversation_id. \
    Devuelve SOLO JSON válido con: {\"type\": \"conversation_message\", \"params\": {\"conversation_id\": \"...\", \"message\": \"...\"}}.";

const SOCIAL_PROMPT: &str = "Eres un ciudadano de MOLTVILLE. Genera un mensaje social breve y natural. \
    Responde SOLO JSON con {message}. Mantente 100% in-world.";

const JUDGE_PROMPT: &str = "Eres un ciudadano de MOLTVILLE evaluando una interacción social. \
    Devuelve SOLO JSON con campos: affinityDelta, trustDelta, respectDelta (-2 a 2), \
    y note (máx 8 palabras) en tono in-world.";

const PROFILE_PROMPT: &str = "Eres un agente recién llegado a MOLTVILLE. Debes crear tu propio perfil. \
    No menciones IA, modelos ni sistemas. Responde SOLO JSON. \
    Incluye: traits (ambition,sociability,curiosity,discipline) valores 0-1, \
    goals (3 metas de largo plazo), style (como hablas), \
    backstory (2 frases), values (3 palabras), quirks (2 hábitos).";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Clone)]
pub struct OracleClient {
    api_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f64,
    max_tokens: u32,
    http: reqwest::Client,
}

impl OracleClient {
    pub fn new(config: &OracleConfig) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            http: reqwest::Client::new(),
        }
    }

    /// Raw completion against the chat endpoint.
    pub async fn complete(&self, system: &str, payload: &Value) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.api_url);
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: payload.to_string(),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut req = self.http.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send oracle request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Oracle API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse oracle response")?;

        completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("Empty oracle response"))
    }

    /// Completion coaxed into a single JSON object; any failure is None.
    async fn complete_json(&self, system: &str, payload: &Value) -> Option<Value> {
        match self.complete(system, payload).await {
            Ok(content) => extract_json(&content),
            Err(error) => {
                debug!("oracle call failed: {}", error);
                None
            }
        }
    }

    /// Asks for the next action. In forced mode the model must reply inside
    /// the given conversation; a missing conversation_id in the reply is
    /// backfilled before the result reaches the validator.
    pub async fn propose_action(&self, context: &Value, forced_conversation: Option<&str>) -> Option<Value> {
        let system = if forced_conversation.is_some() {
            FORCED_REPLY_PROMPT
        } else {
            PROPOSE_PROMPT
        };
        let mut payload = context.clone();
        if let (Some(obj), Some(conv)) = (payload.as_object_mut(), forced_conversation) {
            obj.insert("forcedConversationId".to_string(), json!(conv));
        }
        let mut action = self.complete_json(system, &payload).await?;
        if let Some(conv) = forced_conversation {
            backfill_conversation_id(&mut action, conv);
        }
        Some(action)
    }

    /// A short in-world line for one social purpose (greeting, campaign,
    /// job_support, plan_date, help_citizens). None rather than an empty or
    /// malformed reply.
    pub async fn social_message(&self, kind: &str, mut payload: Value) -> Option<String> {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("kind".to_string(), json!(kind));
        }
        let result = self.complete_json(SOCIAL_PROMPT, &payload).await?;
        let message = result.get("message")?.as_str()?.trim().to_string();
        if message.is_empty() {
            None
        } else {
            Some(message)
        }
    }

    /// Judges one incoming message. Falls back to a small keyword lexicon
    /// when the oracle is unreachable, so relationships still move.
    pub async fn judge_relationship(
        &self,
        self_name: &str,
        other_id: &str,
        message: &str,
    ) -> RelationshipJudgment {
        let payload = json!({
            "self": self_name,
            "otherId": other_id,
            "message": message,
        });
        if let Some(value) = self.complete_json(JUDGE_PROMPT, &payload).await {
            if let Ok(judgment) = serde_json::from_value::<RelationshipJudgment>(value) {
                return judgment;
            }
        }
        lexical_judgment(message)
    }

    /// First-run self-authored profile. None leaves the citizen profileless
    /// until the next attempt.
    pub async fn bootstrap_profile(&self, name: &str, personality_hint: &str) -> Option<Value> {
        let payload = json!({
            "name": name,
            "personality_hint": personality_hint,
        });
        self.complete_json(PROFILE_PROMPT, &payload).await
    }
}

/// Keyword fallback for relationship judgment.
pub fn lexical_judgment(message: &str) -> RelationshipJudgment {
    let lowered = message.to_lowercase();
    let positive = ["gracias", "genial", "perfecto", "me encanta", "bien", "claro"];
    let negative = ["no", "mal", "nunca", "molesta", "odio", "mentira"];
    let score = if positive.iter().any(|p| lowered.contains(p)) {
        1
    } else if negative.iter().any(|n| lowered.contains(n)) {
        -1
    } else {
        0
    };
    RelationshipJudgment {
        affinity_delta: score,
        trust_delta: score,
        respect_delta: 0,
        note: match score {
            1 => "buena impresión",
            -1 => "tenso",
            _ => "neutral",
        }
        .to_string(),
    }
}

fn backfill_conversation_id(action: &mut Value, conversation_id: &str) {
    let has_id = action
        .pointer("/params/conversation_id")
        .and_then(|v| v.as_str())
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
        || action
            .pointer("/params/conversationId")
            .and_then(|v| v.as_str())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
    if has_id {
        return;
    }
    if action.get("params").and_then(|p| p.as_object()).is_none() {
        if let Some(obj) = action.as_object_mut() {
            obj.insert("params".to_string(), json!({}));
        }
    }
    if let Some(params) = action.get_mut("params").and_then(|p| p.as_object_mut()) {
        params.insert("conversation_id".to_string(), json!(conversation_id));
    }
}

/// Coaxes model output into a single JSON object. Tries a direct parse,
/// then a fenced ```json block, then the first balanced `{...}` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..end].trim()) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
    }

    // First balanced brace span, skipping braces inside string literals.
    let bytes = trimmed.as_bytes();
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..=start + offset];
                    return serde_json::from_str::<Value>(candidate)
                        .ok()
                        .filter(|v| v.is_object());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_a_plain_object() {
        let value = extract_json(r#"{"type": "wait", "params": {}}"#).unwrap();
        assert_eq!(value["type"], "wait");
    }

    #[test]
    fn extracts_from_a_fenced_block() {
        let text = "Claro, aquí está:\n```json\n{\"type\": \"speak\", \"params\": {\"message\": \"hola\"}}\n```\n";
        let value = extract_json(text).unwrap();
        assert_eq!(value["type"], "speak");
    }

    #[test]
    fn extracts_an_embedded_object_from_noisy_text() {
        let text = "Voy a moverme. {\"type\": \"move_to\", \"params\": {\"x\": 16, \"y\": 18}} Eso es todo.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["params"]["x"], 16);
    }

    #[test]
    fn nested_braces_and_braces_in_strings_balance() {
        let text = "resultado: {\"a\": {\"b\": \"tiene } dentro\"}, \"c\": 1}";
        let value = extract_json(text).unwrap();
        assert_eq!(value["c"], 1);
    }

    #[test]
    fn arrays_and_garbage_yield_none() {
        assert!(extract_json("[1, 2, 3]").is_none());
        assert!(extract_json("no hay json aquí").is_none());
        assert!(extract_json("{rotísimo").is_none());
    }

    #[test]
    fn lexicon_scores_both_polarities() {
        let good = lexical_judgment("¡Gracias, me encanta este lugar!");
        assert_eq!(good.affinity_delta, 1);
        assert_eq!(good.note, "buena impresión");

        let bad = lexical_judgment("Nunca más te ayudo");
        assert_eq!(bad.trust_delta, -1);

        let flat = lexical_judgment("voy al mercado");
        assert_eq!(flat.affinity_delta, 0);
        assert_eq!(flat.note, "neutral");
    }

    #[test]
    fn backfill_only_touches_missing_ids() {
        let mut action = serde_json::json!({"type": "conversation_message", "params": {"message": "hola"}});
        backfill_conversation_id(&mut action, "conv-9");
        assert_eq!(action["params"]["conversation_id"], "conv-9");

        let mut keep = serde_json::json!({"type": "conversation_message", "params": {"conversation_id": "mine", "message": "hola"}});
        backfill_conversation_id(&mut keep, "conv-9");
        assert_eq!(keep["params"]["conversation_id"], "mine");
    }
}
