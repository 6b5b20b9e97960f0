//! Data contracts for what the world server reports back on each tick.
//!
//! Field names mirror the server's camelCase wire format. Everything is
//! `#[serde(default)]`-tolerant: a partial snapshot must never abort a
//! decision cycle.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NearbyAgent {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NearbyBuilding {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub building_type: String,
    pub position: Option<Position>,
    pub width: i64,
    pub height: i64,
}

impl Default for NearbyBuilding {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            building_type: String::new(),
            position: None,
            width: 1,
            height: 1,
        }
    }
}

impl NearbyBuilding {
    /// The walkable point just outside a building's footprint: horizontal
    /// center, one row below the bottom edge.
    pub fn approach_point(&self) -> Position {
        let base = self.position.unwrap_or(Position { x: 0, y: 0 });
        Position {
            x: base.x + (self.width / 2).max(0),
            y: base.y + self.height.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Needs {
    pub hunger: f64,
    pub energy: f64,
    pub social: f64,
}

impl Default for Needs {
    fn default() -> Self {
        // Server semantics: hunger grows from 0, energy and social decay
        // from 100.
        Self {
            hunger: 0.0,
            energy: 100.0,
            social: 100.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EconomyContext {
    pub balance: f64,
    pub job: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldContext {
    pub economy: EconomyContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuggestedGoal {
    #[serde(rename = "type")]
    pub goal_type: String,
    pub target_types: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationMessage {
    pub from: String,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveConversation {
    pub id: String,
    pub participants: Vec<String>,
    pub messages: Vec<ConversationMessage>,
    pub started_at: Option<i64>,
    pub last_activity: Option<i64>,
}

impl LiveConversation {
    pub fn latest_message(&self) -> Option<&ConversationMessage> {
        self.messages.iter().max_by_key(|m| m.timestamp)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldTime {
    pub phase: Option<String>,
    pub day_progress: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildingRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerceptionSnapshot {
    pub position: Option<Position>,
    pub current_building: Option<BuildingRef>,
    pub nearby_agents: Vec<NearbyAgent>,
    pub nearby_buildings: Vec<NearbyBuilding>,
    pub needs: Needs,
    pub context: WorldContext,
    pub suggested_goals: Vec<SuggestedGoal>,
    pub conversations: Vec<LiveConversation>,
    pub world_time: Option<WorldTime>,
}

impl PerceptionSnapshot {
    pub fn balance(&self) -> f64 {
        self.context.economy.balance
    }

    pub fn has_job(&self) -> bool {
        self.context
            .economy
            .job
            .as_ref()
            .map(|j| !j.is_null())
            .unwrap_or(false)
    }

    pub fn day_phase(&self) -> DayPhase {
        match &self.world_time {
            Some(wt) => match wt.phase.as_deref() {
                Some("morning") => DayPhase::Morning,
                Some("afternoon") => DayPhase::Afternoon,
                Some("night") => DayPhase::Night,
                _ => DayPhase::from_progress(wt.day_progress),
            },
            None => DayPhase::from_progress(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayPhase {
    Morning,
    Afternoon,
    Night,
}

impl DayPhase {
    pub fn from_progress(progress: f64) -> Self {
        if progress < 0.35 {
            DayPhase::Morning
        } else if progress < 0.7 {
            DayPhase::Afternoon
        } else {
            DayPhase::Night
        }
    }
}

/// A goal pushed by the server, retained until its TTL elapses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActiveGoal {
    pub goal_type: Option<String>,
    pub description: Option<String>,
    pub urgency: f64,
    pub location: Option<GoalLocation>,
    pub event: Option<serde_json::Value>,
    #[serde(default = "default_goal_ttl_ms")]
    pub ttl_ms: i64,
    pub received_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoalLocation {
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub building_id: Option<String>,
}

fn default_goal_ttl_ms() -> i64 {
    15 * 60 * 1000
}
