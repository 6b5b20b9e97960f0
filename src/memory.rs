//! Durable cross-session memory: episodes, relationship scores, and the
//! long-horizon planner state.
//!
//! The record is owned exclusively by this process. It is read once at
//! startup and fully rewritten to disk after every mutation; a failed write
//! is logged and retried implicitly on the next mutation, never fatal.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::motivation::MotivationState;
use crate::plan::{GoalState, PlanState};

pub const MAX_EPISODES: usize = 80;
const MAX_NOTE_LEN: usize = 80;
const MAX_LAST_MESSAGE_LEN: usize = 160;

/// One remembered event, newest last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
}

/// How the citizen feels about one other agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationshipScore {
    pub affinity: i64,
    pub trust: i64,
    pub respect: i64,
    pub last_note: String,
    pub last_message: String,
}

/// Bounded deltas produced by the relationship analyzer (oracle judgment or
/// keyword fallback).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationshipJudgment {
    pub affinity_delta: i64,
    pub trust_delta: i64,
    pub respect_delta: i64,
    pub note: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryRecord {
    pub episodes: Vec<Episode>,
    pub relationships: BTreeMap<String, RelationshipScore>,
    pub motivation_state: Option<MotivationState>,
    pub goal_state: Option<GoalState>,
    pub plan_state: Option<PlanState>,
    pub profile: Option<Value>,
}

/// Owns the record and its backing file. Every mutating helper persists
/// immediately so a crash loses at most the in-flight mutation.
pub struct MemoryStore {
    path: PathBuf,
    pub record: MemoryRecord,
}

impl MemoryStore {
    /// Load from `path`, falling back to an empty record on any read or
    /// parse failure.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let record = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Memory file {:?} is unreadable, starting fresh: {}", path, e);
                    MemoryRecord::default()
                }
            },
            Err(_) => MemoryRecord::default(),
        };
        Self { path, record }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the whole record. Failure is logged and swallowed; the next
    /// mutation will try again.
    pub fn persist(&self) {
        match serde_json::to_string_pretty(&self.record) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.path, json) {
                    tracing::warn!("Failed to persist memory to {:?}: {}", self.path, e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize memory record: {}", e),
        }
    }

    /// Append an episode, trimming oldest-first past the cap.
    pub fn record_episode(&mut self, kind: &str, data: Value, now_ms: i64) {
        self.record.episodes.push(Episode {
            kind: kind.to_string(),
            data,
            timestamp: now_ms,
        });
        let len = self.record.episodes.len();
        if len > MAX_EPISODES {
            self.record.episodes.drain(0..len - MAX_EPISODES);
        }
        self.persist();
    }

    /// Fold an analyzer judgment into the speaker's relationship score.
    /// Deltas are clamped to [-2, 2] before applying and the resulting
    /// scores to [-10, 10] after, so no input magnitude can overshoot.
    pub fn apply_relationship_judgment(
        &mut self,
        speaker_id: &str,
        message: &str,
        judgment: &RelationshipJudgment,
    ) {
        if speaker_id.is_empty() {
            return;
        }
        let entry = self
            .record
            .relationships
            .entry(speaker_id.to_string())
            .or_default();
        entry.affinity = clamp_score(entry.affinity + clamp_delta(judgment.affinity_delta));
        entry.trust = clamp_score(entry.trust + clamp_delta(judgment.trust_delta));
        entry.respect = clamp_score(entry.respect + clamp_delta(judgment.respect_delta));
        entry.last_note = truncate(&judgment.note, MAX_NOTE_LEN);
        entry.last_message = truncate(message, MAX_LAST_MESSAGE_LEN);
        self.persist();
    }

    /// Share of known relationships that count as approving (affinity or
    /// trust at least 2). Zero when nobody is known.
    pub fn approval_ratio(&self) -> f64 {
        let total = self.record.relationships.len();
        if total == 0 {
            return 0.0;
        }
        let approving = self
            .record
            .relationships
            .values()
            .filter(|r| r.affinity >= 2 || r.trust >= 2)
            .count();
        approving as f64 / total as f64
    }

    pub fn approving_count(&self) -> usize {
        self.record
            .relationships
            .values()
            .filter(|r| r.affinity >= 2 || r.trust >= 2)
            .count()
    }

    pub fn max_trust(&self) -> i64 {
        self.record
            .relationships
            .values()
            .map(|r| r.trust)
            .max()
            .unwrap_or(0)
    }
}

fn clamp_delta(delta: i64) -> i64 {
    delta.clamp(-2, 2)
}

fn clamp_score(score: i64) -> i64 {
    score.clamp(-10, 10)
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
