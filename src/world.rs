//! World transport: the seam between the decision core and the MOLTVILLE
//! server. `HttpWorld` speaks the server's HTTP API and feeds pushed events
//! through a flume channel; tests substitute a scripted mock.

use anyhow::{Context, Result};
use async_trait::async_trait;
use flume::Sender;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::AgentIdentity;
use crate::perception::{ActiveGoal, PerceptionSnapshot};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PendingApplication {
    pub applicant_id: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobPosting {
    pub id: String,
    pub name: Option<String>,
    pub assigned_to: Option<String>,
    pub salary: Option<f64>,
    pub application: Option<PendingApplication>,
}

/// The agent's own pending job application, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnApplication {
    pub job_id: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Property {
    pub id: String,
    pub name: Option<String>,
    pub for_sale: bool,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FavorSummary {
    pub owed: i64,
    pub given: i64,
}

/// Server-pushed events, decoded from the event feed.
#[derive(Debug, Clone)]
pub enum WorldEvent {
    Speech {
        from: String,
        message: String,
    },
    ConversationStarted {
        id: String,
        participants: Vec<String>,
    },
    ConversationMessage {
        conversation_id: String,
        from: String,
        message: String,
    },
    ConversationEnded {
        conversation_id: String,
    },
    GoalAssigned(ActiveGoal),
    AuthRotated {
        api_key: String,
    },
    AuthRevoked,
}

#[async_trait]
pub trait WorldTransport: Send + Sync {
    /// Registers (or re-attaches) the agent; returns the server-assigned id.
    async fn connect(&self, identity: &AgentIdentity) -> Result<String>;
    async fn perceive(&self) -> Result<PerceptionSnapshot>;
    async fn move_to(&self, x: i64, y: i64) -> Result<()>;
    async fn enter_building(&self, building_id: &str) -> Result<()>;
    async fn speak(&self, message: &str) -> Result<()>;
    /// Returns the new conversation id when the server reports one.
    async fn start_conversation(&self, target_id: &str, message: &str) -> Result<Option<String>>;
    async fn send_conversation_message(&self, conversation_id: &str, message: &str) -> Result<()>;
    async fn end_conversation(&self, conversation_id: &str) -> Result<()>;
    async fn list_jobs(&self) -> Result<Vec<JobPosting>>;
    async fn apply_job(&self, job_id: &str) -> Result<()>;
    async fn my_application(&self) -> Result<Option<OwnApplication>>;
    async fn vote_job(&self, applicant_id: &str, job_id: &str) -> Result<()>;
    async fn list_properties(&self) -> Result<Vec<Property>>;
    async fn buy_property(&self, property_id: &str) -> Result<()>;
    async fn propose_negotiation(&self, target_id: &str, job_id: Option<&str>) -> Result<()>;
    async fn register_candidate(&self, name: &str, platform: &str) -> Result<()>;
    async fn favor_summary(&self) -> Result<FavorSummary>;
    async fn push_profile(&self, profile: &Value) -> Result<()>;
    /// Installs a rotated credential for subsequent requests. Transports
    /// without auth ignore it.
    fn rotate_api_key(&self, _api_key: &str) {}
}

pub fn build_http_client() -> reqwest::Client {
    match reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
    {
        Ok(client) => client,
        Err(error) => {
            warn!("HTTP client builder failed ({}), using default client", error);
            reqwest::Client::new()
        }
    }
}

pub struct HttpWorld {
    http: reqwest::Client,
    base_url: String,
    api_key: RwLock<String>,
    agent_id: RwLock<Option<String>>,
    events: Sender<WorldEvent>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    #[serde(rename = "agentId")]
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct StartConversationResponse {
    #[serde(default)]
    conversation: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JobListResponse {
    #[serde(default)]
    jobs: Vec<JobPosting>,
}

#[derive(Debug, Deserialize)]
struct ApplicationResponse {
    #[serde(default)]
    application: Option<OwnApplication>,
}

#[derive(Debug, Deserialize)]
struct PropertyListResponse {
    #[serde(default)]
    properties: Vec<Property>,
}

#[derive(Debug, Deserialize)]
struct FavorResponse {
    #[serde(default)]
    summary: FavorSummary,
}

impl HttpWorld {
    pub fn new(base_url: String, api_key: String, events: Sender<WorldEvent>) -> Self {
        Self {
            http: build_http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: RwLock::new(api_key),
            agent_id: RwLock::new(None),
            events,
        }
    }

    pub fn set_api_key(&self, key: String) {
        if let Ok(mut guard) = self.api_key.write() {
            *guard = key;
        }
    }

    fn current_api_key(&self) -> String {
        self.api_key
            .read()
            .map(|k| k.clone())
            .unwrap_or_default()
    }

    fn current_agent_id(&self) -> Result<String> {
        self.agent_id
            .read()
            .ok()
            .and_then(|g| g.clone())
            .context("Agent not registered yet")
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-API-Key", self.current_api_key())
    }

    async fn post_json(&self, path: &str, payload: &Value) -> Result<Value> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(payload)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("POST {} failed", path))?;
        response
            .json::<Value>()
            .await
            .with_context(|| format!("Failed to decode {} response", path))
    }

    /// Long-poll the event feed, forwarding decoded events into the channel.
    /// Returns when the channel closes or the key is revoked.
    pub async fn poll_events_forever(&self) {
        let mut cursor: i64 = 0;
        loop {
            let agent_id = match self.current_agent_id() {
                Ok(id) => id,
                Err(_) => {
                    sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            let path = format!("/api/moltbot/{}/events", agent_id);
            let result = self
                .request(reqwest::Method::GET, &path)
                .query(&[("since", cursor)])
                .send()
                .await;
            let response = match result {
                Ok(r) => r,
                Err(error) => {
                    debug!("event poll failed: {}", error);
                    sleep(Duration::from_secs(3)).await;
                    continue;
                }
            };
            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                warn!("event feed reports revoked credentials");
                let _ = self.events.send(WorldEvent::AuthRevoked);
                return;
            }
            let envelopes = match response.json::<Vec<EventEnvelope>>().await {
                Ok(list) => list,
                Err(error) => {
                    debug!("event feed decode failed: {}", error);
                    sleep(Duration::from_secs(3)).await;
                    continue;
                }
            };
            cursor += envelopes.len() as i64;
            for envelope in envelopes {
                if let Some(event) = decode_event(&envelope.event_type, &envelope.payload) {
                    let fatal = matches!(event, WorldEvent::AuthRevoked);
                    if self.events.send(event).is_err() || fatal {
                        return;
                    }
                }
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Maps a server event envelope onto a `WorldEvent`. Unknown or malformed
/// envelopes are dropped.
pub fn decode_event(event_type: &str, payload: &Value) -> Option<WorldEvent> {
    match event_type {
        "perception:speech" => {
            let from = payload.get("from")?.as_str()?.to_string();
            let message = payload.get("message")?.as_str()?.to_string();
            Some(WorldEvent::Speech { from, message })
        }
        "conversation:started" => {
            let id = payload.get("id")?.as_str()?.to_string();
            let participants = payload
                .get("participants")?
                .as_array()?
                .iter()
                .filter_map(|p| p.as_str().map(str::to_string))
                .collect();
            Some(WorldEvent::ConversationStarted { id, participants })
        }
        "conversation:message" => {
            let conversation_id = payload.get("conversationId")?.as_str()?.to_string();
            let message = payload.get("message")?;
            let from = message.get("fromId")?.as_str()?.to_string();
            let text = message.get("message")?.as_str()?.to_string();
            Some(WorldEvent::ConversationMessage {
                conversation_id,
                from,
                message: text,
            })
        }
        "conversation:ended" => {
            let conversation_id = payload.get("conversationId")?.as_str()?.to_string();
            Some(WorldEvent::ConversationEnded { conversation_id })
        }
        "agent:goal" => serde_json::from_value::<ActiveGoal>(payload.clone())
            .ok()
            .map(WorldEvent::GoalAssigned),
        "auth:rotated" => {
            let api_key = payload.get("apiKey")?.as_str()?.trim().to_string();
            if api_key.is_empty() {
                return None;
            }
            Some(WorldEvent::AuthRotated { api_key })
        }
        "error" => {
            if payload.get("message").and_then(|m| m.as_str()) == Some("API key revoked") {
                Some(WorldEvent::AuthRevoked)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[async_trait]
impl WorldTransport for HttpWorld {
    async fn connect(&self, identity: &AgentIdentity) -> Result<String> {
        let payload = json!({
            "apiKey": self.current_api_key(),
            "agentId": identity.id,
            "agentName": identity.name,
            "avatar": identity.avatar,
            "personality": identity.personality,
        });
        let response = self
            .request(reqwest::Method::POST, "/api/moltbot/connect")
            .json(&payload)
            .send()
            .await?
            .error_for_status()
            .context("POST /api/moltbot/connect failed")?
            .json::<ConnectResponse>()
            .await
            .context("Failed to decode connect response")?;
        if let Ok(mut guard) = self.agent_id.write() {
            *guard = Some(response.agent_id.clone());
        }
        info!(agent_id = %response.agent_id, "registered with world server");
        Ok(response.agent_id)
    }

    async fn perceive(&self) -> Result<PerceptionSnapshot> {
        let agent_id = self.current_agent_id()?;
        let path = format!("/api/moltbot/{}/perception", agent_id);
        self.request(reqwest::Method::GET, &path)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("GET {} failed", path))?
            .json::<PerceptionSnapshot>()
            .await
            .context("Failed to decode perception")
    }

    async fn move_to(&self, x: i64, y: i64) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        let path = format!("/api/moltbot/{}/actions/move", agent_id);
        self.post_json(&path, &json!({ "targetX": x, "targetY": y }))
            .await?;
        Ok(())
    }

    async fn enter_building(&self, building_id: &str) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        let path = format!("/api/moltbot/{}/actions/enter", agent_id);
        self.post_json(&path, &json!({ "buildingId": building_id }))
            .await?;
        Ok(())
    }

    async fn speak(&self, message: &str) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        let path = format!("/api/moltbot/{}/actions/speak", agent_id);
        self.post_json(&path, &json!({ "message": message })).await?;
        Ok(())
    }

    async fn start_conversation(&self, target_id: &str, message: &str) -> Result<Option<String>> {
        let agent_id = self.current_agent_id()?;
        let path = format!("/api/moltbot/{}/conversations/start", agent_id);
        let body = self
            .post_json(&path, &json!({ "targetId": target_id, "message": message }))
            .await?;
        let response: StartConversationResponse = serde_json::from_value(body)
            .context("Failed to decode start conversation response")?;
        Ok(response
            .conversation
            .and_then(|c| c.get("id").and_then(|i| i.as_str()).map(str::to_string)))
    }

    async fn send_conversation_message(&self, conversation_id: &str, message: &str) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        let path = format!(
            "/api/moltbot/{}/conversations/{}/message",
            agent_id, conversation_id
        );
        self.post_json(&path, &json!({ "message": message })).await?;
        Ok(())
    }

    async fn end_conversation(&self, conversation_id: &str) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        let path = format!(
            "/api/moltbot/{}/conversations/{}/end",
            agent_id, conversation_id
        );
        self.post_json(&path, &json!({})).await?;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<JobPosting>> {
        let response = self
            .request(reqwest::Method::GET, "/api/economy/jobs")
            .send()
            .await?
            .error_for_status()
            .context("GET /api/economy/jobs failed")?
            .json::<JobListResponse>()
            .await
            .context("Failed to decode job list")?;
        Ok(response.jobs)
    }

    async fn apply_job(&self, job_id: &str) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        self.post_json(
            "/api/economy/jobs/apply",
            &json!({ "agentId": agent_id, "jobId": job_id }),
        )
        .await?;
        Ok(())
    }

    async fn my_application(&self) -> Result<Option<OwnApplication>> {
        let agent_id = self.current_agent_id()?;
        let path = format!("/api/economy/jobs/applications/{}", agent_id);
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("GET {} failed", path))?
            .json::<ApplicationResponse>()
            .await
            .context("Failed to decode application response")?;
        Ok(response.application)
    }

    async fn vote_job(&self, applicant_id: &str, job_id: &str) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        self.post_json(
            "/api/economy/jobs/vote",
            &json!({ "applicantId": applicant_id, "voterId": agent_id, "jobId": job_id }),
        )
        .await?;
        Ok(())
    }

    async fn list_properties(&self) -> Result<Vec<Property>> {
        let response = self
            .request(reqwest::Method::GET, "/api/economy/properties")
            .send()
            .await?
            .error_for_status()
            .context("GET /api/economy/properties failed")?
            .json::<PropertyListResponse>()
            .await
            .context("Failed to decode property list")?;
        Ok(response.properties)
    }

    async fn buy_property(&self, property_id: &str) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        self.post_json(
            "/api/economy/properties/buy",
            &json!({ "agentId": agent_id, "propertyId": property_id }),
        )
        .await?;
        Ok(())
    }

    async fn propose_negotiation(&self, target_id: &str, job_id: Option<&str>) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        self.post_json(
            "/api/negotiation/propose",
            &json!({
                "from": agent_id,
                "to": target_id,
                "ask": { "type": "vote_job", "jobId": job_id },
                "offer": { "type": "favor", "value": 1, "reason": "voto" },
                "reason": "negociacion_trabajo",
            }),
        )
        .await?;
        Ok(())
    }

    async fn register_candidate(&self, name: &str, platform: &str) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        self.post_json(
            "/api/governance/candidate",
            &json!({ "agentId": agent_id, "name": name, "platform": platform }),
        )
        .await?;
        Ok(())
    }

    async fn favor_summary(&self) -> Result<FavorSummary> {
        let agent_id = self.current_agent_id()?;
        let path = format!("/api/favor/{}", agent_id);
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("GET {} failed", path))?
            .json::<FavorResponse>()
            .await
            .context("Failed to decode favor summary")?;
        Ok(response.summary)
    }

    async fn push_profile(&self, profile: &Value) -> Result<()> {
        let agent_id = self.current_agent_id()?;
        let path = format!("/api/moltbot/{}/profile", agent_id);
        self.post_json(&path, &json!({ "profile": profile })).await?;
        Ok(())
    }

    fn rotate_api_key(&self, api_key: &str) {
        self.set_api_key(api_key.to_string());
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn speech_event_decodes() {
        let event = decode_event(
            "perception:speech",
            &json!({ "from": "a1", "message": "hola" }),
        );
        assert!(matches!(
            event,
            Some(WorldEvent::Speech { from, message }) if from == "a1" && message == "hola"
        ));
    }

    #[test]
    fn conversation_message_requires_nested_fields() {
        let ok = decode_event(
            "conversation:message",
            &json!({
                "conversationId": "c1",
                "message": { "fromId": "a2", "message": "buenas" }
            }),
        );
        assert!(matches!(ok, Some(WorldEvent::ConversationMessage { .. })));

        let missing = decode_event(
            "conversation:message",
            &json!({ "conversationId": "c1", "message": { "fromId": "a2" } }),
        );
        assert!(missing.is_none());
    }

    #[test]
    fn rotation_with_blank_key_is_dropped() {
        assert!(decode_event("auth:rotated", &json!({ "apiKey": "  " })).is_none());
        let event = decode_event("auth:rotated", &json!({ "apiKey": "fresh" }));
        assert!(matches!(event, Some(WorldEvent::AuthRotated { api_key }) if api_key == "fresh"));
    }

    #[test]
    fn revocation_is_the_only_fatal_error_payload() {
        assert!(matches!(
            decode_event("error", &json!({ "message": "API key revoked" })),
            Some(WorldEvent::AuthRevoked)
        ));
        assert!(decode_event("error", &json!({ "message": "rate limited" })).is_none());
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert!(decode_event("weather:update", &json!({})).is_none());
    }

    #[test]
    fn goal_event_carries_ttl_default() {
        let event = decode_event("agent:goal", &json!({ "urgency": 0.9 }));
        match event {
            Some(WorldEvent::GoalAssigned(goal)) => {
                assert_eq!(goal.ttl_ms, 15 * 60 * 1000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
