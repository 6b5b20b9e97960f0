//! Per-process session state. Everything here is rebuilt on restart except
//! the memory store, which is the durable half of the agent.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::action::is_meta_text;
use crate::intent::{select_intent, HotspotPicker, Intent};
use crate::memory::MemoryStore;
use crate::perception::{ActiveGoal, DayPhase, Needs};
use crate::persona::TraitVector;

const MAX_UTTERANCES: usize = 12;
const MAX_UTTERANCE_LEN: usize = 280;
const MAX_ACTIVE_GOALS: usize = 10;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One overheard or received line, kept for oracle context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utterance {
    pub speaker_id: String,
    pub message: String,
    pub timestamp: i64,
}

pub struct AgentSession {
    pub agent_id: Option<String>,
    pub traits: TraitVector,
    pub memory: MemoryStore,
    pub active_goals: Vec<ActiveGoal>,
    /// other agent id -> conversation id
    pub conversations: HashMap<String, String>,
    pub recent_utterances: Vec<Utterance>,
    pub current_intent: Option<Intent>,
    pub intent_expires_at: i64,
    pub hotspots: HotspotPicker,
    pub political_candidate: bool,
    pub last_relation_update: HashMap<String, i64>,
    pub last_reply_at: HashMap<String, i64>,
    pub last_reply_msg: HashMap<String, String>,
    pub connected: bool,
    pub profile_last_sent: i64,
}

impl AgentSession {
    pub fn new(traits: TraitVector, memory: MemoryStore) -> Self {
        Self {
            agent_id: None,
            traits,
            memory,
            active_goals: Vec::new(),
            conversations: HashMap::new(),
            recent_utterances: Vec::new(),
            current_intent: None,
            intent_expires_at: 0,
            hotspots: HotspotPicker::default(),
            political_candidate: false,
            last_relation_update: HashMap::new(),
            last_reply_at: HashMap::new(),
            last_reply_msg: HashMap::new(),
            connected: false,
            profile_last_sent: 0,
        }
    }

    /// Remembers a non-meta utterance, truncated, keeping the newest 12.
    pub fn remember_utterance(&mut self, speaker_id: &str, message: &str, now: i64) {
        if speaker_id.is_empty() || message.is_empty() || is_meta_text(message) {
            return;
        }
        let trimmed: String = message.trim().chars().take(MAX_UTTERANCE_LEN).collect();
        self.recent_utterances.push(Utterance {
            speaker_id: speaker_id.to_string(),
            message: trimmed,
            timestamp: now,
        });
        if self.recent_utterances.len() > MAX_UTTERANCES {
            let excess = self.recent_utterances.len() - MAX_UTTERANCES;
            self.recent_utterances.drain(..excess);
        }
    }

    pub fn note_conversation(&mut self, other_id: &str, conversation_id: &str) {
        self.conversations
            .insert(other_id.to_string(), conversation_id.to_string());
    }

    pub fn forget_conversation(&mut self, conversation_id: &str) {
        self.conversations.retain(|_, v| v != conversation_id);
    }

    /// Drops tracked conversations the world no longer reports.
    pub fn prune_conversations(&mut self, live_ids: &[String]) -> Vec<String> {
        let dropped: Vec<String> = self
            .conversations
            .values()
            .filter(|id| !live_ids.contains(id))
            .cloned()
            .collect();
        self.conversations.retain(|_, id| live_ids.contains(id));
        for id in &dropped {
            self.last_reply_at.remove(id);
            self.last_reply_msg.remove(id);
        }
        dropped
    }

    pub fn note_goal(&mut self, mut goal: ActiveGoal, now: i64) {
        goal.received_at = now;
        self.active_goals.push(goal);
    }

    /// TTL-prunes goals and keeps only the most recent few.
    pub fn prune_goals(&mut self, now: i64) {
        self.active_goals
            .retain(|g| now - g.received_at < g.ttl_ms.max(1));
        if self.active_goals.len() > MAX_ACTIVE_GOALS {
            let excess = self.active_goals.len() - MAX_ACTIVE_GOALS;
            self.active_goals.drain(..excess);
        }
    }

    /// Current intent, re-selected when the TTL lapses. The TTL is jittered
    /// so a town of citizens does not re-decide in lockstep.
    pub fn intent(
        &mut self,
        needs: &Needs,
        phase: DayPhase,
        ttl_base_ms: i64,
        ttl_jitter_ms: i64,
        now: i64,
    ) -> Intent {
        if let Some(intent) = self.current_intent {
            if now < self.intent_expires_at {
                return intent;
            }
        }
        let intent = select_intent(needs, &self.traits, phase);
        let jitter = if ttl_jitter_ms > 0 {
            rand::rng().random_range(0..ttl_jitter_ms)
        } else {
            0
        };
        self.current_intent = Some(intent);
        self.intent_expires_at = now + ttl_base_ms + jitter;
        intent
    }

    /// Per-speaker cooldown for relationship analysis.
    pub fn relation_update_due(&self, speaker_id: &str, cooldown_ms: i64, now: i64) -> bool {
        self.last_relation_update
            .get(speaker_id)
            .map(|last| now - last >= cooldown_ms)
            .unwrap_or(true)
    }

    pub fn mark_relation_updated(&mut self, speaker_id: &str, now: i64) {
        self.last_relation_update
            .insert(speaker_id.to_string(), now);
    }

    /// Dedupe guard for conversation replies: skip when we already replied
    /// to this exact text, or to something at least as new.
    pub fn already_replied(&self, conversation_id: &str, text: &str, timestamp: Option<i64>) -> bool {
        if self
            .last_reply_msg
            .get(conversation_id)
            .map(|m| m == text)
            .unwrap_or(false)
        {
            return true;
        }
        match (timestamp, self.last_reply_at.get(conversation_id)) {
            (Some(ts), Some(last)) => ts <= *last,
            _ => false,
        }
    }

    pub fn mark_replied(&mut self, conversation_id: &str, text: &str, now: i64) {
        self.last_reply_at.insert(conversation_id.to_string(), now);
        self.last_reply_msg
            .insert(conversation_id.to_string(), text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use tempfile::tempdir;

    fn session() -> AgentSession {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::load(dir.path().join("mem.json"));
        AgentSession::new(TraitVector::default(), memory)
    }

    #[test]
    fn utterance_ring_caps_at_twelve_and_filters_meta() {
        let mut s = session();
        for i in 0..20 {
            s.remember_utterance("a1", &format!("mensaje {}", i), i);
        }
        assert_eq!(s.recent_utterances.len(), 12);
        assert_eq!(s.recent_utterances[0].message, "mensaje 8");

        s.remember_utterance("a1", "revisa el prompt del sistema", 99);
        assert!(s
            .recent_utterances
            .iter()
            .all(|u| !u.message.contains("prompt")));
    }

    #[test]
    fn long_utterances_are_truncated() {
        let mut s = session();
        let long = "x".repeat(500);
        s.remember_utterance("a1", &long, 0);
        assert_eq!(s.recent_utterances[0].message.chars().count(), 280);
    }

    #[test]
    fn pruning_drops_conversations_the_world_stopped_reporting() {
        let mut s = session();
        s.note_conversation("a1", "c1");
        s.note_conversation("a2", "c2");
        s.mark_replied("c2", "hola", 10);

        let dropped = s.prune_conversations(&["c1".to_string()]);
        assert_eq!(dropped, ["c2"]);
        assert_eq!(s.conversations.len(), 1);
        assert!(s.last_reply_msg.get("c2").is_none());
    }

    #[test]
    fn goal_pruning_honors_ttl_and_cap() {
        let mut s = session();
        for i in 0..12 {
            let goal = ActiveGoal {
                ttl_ms: 1_000,
                ..ActiveGoal::default()
            };
            s.note_goal(goal, i);
        }
        s.prune_goals(500);
        assert_eq!(s.active_goals.len(), MAX_ACTIVE_GOALS);

        s.prune_goals(2_000);
        assert!(s.active_goals.is_empty());
    }

    #[test]
    fn intent_is_cached_until_its_ttl() {
        let mut s = session();
        let needs = Needs {
            hunger: 0.0,
            energy: 100.0,
            social: 100.0,
        };
        let first = s.intent(&needs, DayPhase::Morning, 240_000, 0, 0);
        assert_eq!(s.intent(&needs, DayPhase::Night, 240_000, 0, 100_000), first);
        // After expiry the phase change can flip the choice; either way the
        // expiry moves forward.
        let _ = s.intent(&needs, DayPhase::Night, 240_000, 0, 300_000);
        assert!(s.intent_expires_at >= 540_000);
    }

    #[test]
    fn reply_dedupe_matches_text_and_timestamp() {
        let mut s = session();
        assert!(!s.already_replied("c1", "hola", Some(5)));
        s.mark_replied("c1", "hola", 10);
        assert!(s.already_replied("c1", "hola", None));
        assert!(s.already_replied("c1", "otra cosa", Some(9)));
        assert!(!s.already_replied("c1", "otra cosa", Some(11)));
    }

    #[test]
    fn relation_cooldown_gates_per_speaker() {
        let mut s = session();
        assert!(s.relation_update_due("a1", 8_000, 0));
        s.mark_relation_updated("a1", 0);
        assert!(!s.relation_update_due("a1", 8_000, 5_000));
        assert!(s.relation_update_due("a1", 8_000, 8_000));
        assert!(s.relation_update_due("a2", 8_000, 1));
    }
}
