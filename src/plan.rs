//! Tactical planning: a short-lived plan derived from the current
//! motivation chain and intent, refreshed on a TTL or when the last action
//! demonstrably failed.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::Action;
use crate::intent::Intent;
use crate::motivation::{MotivationState, StepStatus};
use crate::perception::PerceptionSnapshot;

pub const DEFAULT_PLAN_TTL_MS: i64 = 180_000;
pub const DEFAULT_ACTION_TIMEOUT_MS: i64 = 45_000;

/// Durable view of the agent's pursued goal, persisted alongside the
/// motivation chain. `target_price` freezes the cheapest for-sale asking
/// price the first time a savings step needs one, so the savings bar does
/// not drift with the market.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalState {
    pub primary: String,
    pub status: String,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub target_price: Option<f64>,
    pub updated_at: i64,
}

impl GoalState {
    pub fn from_motivation(motivation: &MotivationState, now: i64) -> Self {
        GoalState {
            primary: motivation.desire.as_str().to_string(),
            status: if motivation.is_exhausted() {
                "completed".to_string()
            } else {
                "active".to_string()
            },
            nodes: motivation.chain.iter().map(|s| s.id.clone()).collect(),
            target_price: None,
            updated_at: now,
        }
    }

    /// Freezes the savings target once; later calls keep the first price.
    pub fn freeze_target_price(&mut self, cheapest_for_sale: f64, now: i64) {
        if self.target_price.is_none() {
            self.target_price = Some(cheapest_for_sale);
            self.updated_at = now;
            debug!(price = cheapest_for_sale, "savings target frozen");
        }
    }

    pub fn refresh(&mut self, motivation: &MotivationState, now: i64) {
        self.status = if motivation.is_exhausted() {
            "completed".to_string()
        } else {
            "active".to_string()
        };
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanState {
    pub primary_goal: String,
    #[serde(default)]
    pub secondary_goals: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    pub last_plan_at: i64,
    #[serde(default)]
    pub last_action: Option<Action>,
    #[serde(default)]
    pub last_action_at: i64,
}

impl PlanState {
    pub fn record_action(&mut self, action: &Action, now: i64) {
        self.last_action = Some(action.clone());
        self.last_action_at = now;
    }
}

/// Builds a fresh plan from the motivation chain (when one exists) and the
/// current intent as the fallback theme.
pub fn generate_plan(motivation: Option<&MotivationState>, intent: Intent, now: i64) -> PlanState {
    let (primary_goal, secondary_goals) = match motivation {
        Some(state) if !state.is_exhausted() => {
            let pending: Vec<String> = state
                .chain
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .map(|s| s.label.clone())
                .collect();
            let primary = pending
                .first()
                .cloned()
                .unwrap_or_else(|| state.desire.as_str().to_string());
            let secondary = pending.iter().skip(1).take(2).cloned().collect();
            (primary, secondary)
        }
        _ => {
            let theme = match intent {
                Intent::Social => "Spend time with other citizens",
                Intent::Work => "Keep the work routine going",
                Intent::Leisure => "Explore and unwind",
            };
            (theme.to_string(), Vec::new())
        }
    };

    PlanState {
        primary_goal,
        secondary_goals,
        actions: Vec::new(),
        last_plan_at: now,
        last_action: None,
        last_action_at: 0,
    }
}

/// Regenerates the plan when missing or older than the TTL; otherwise the
/// existing plan stands.
pub fn ensure_plan(
    plan: &mut Option<PlanState>,
    motivation: Option<&MotivationState>,
    intent: Intent,
    ttl_ms: i64,
    now: i64,
) -> bool {
    let stale = match plan {
        Some(p) => now - p.last_plan_at > ttl_ms,
        None => true,
    };
    if stale {
        *plan = Some(generate_plan(motivation, intent, now));
        debug!("tactical plan regenerated");
    }
    stale
}

/// A plan needs replacing early when its last action has had time to land
/// and the world shows no sign it did.
pub fn should_replan(plan: &PlanState, perception: &PerceptionSnapshot, timeout_ms: i64, now: i64) -> bool {
    let Some(action) = &plan.last_action else {
        return false;
    };
    if now - plan.last_action_at < timeout_ms {
        return false;
    }
    !action_succeeded(action, perception)
}

/// Best-effort success check per action type. Only the three observable
/// outcomes are verified; everything else is assumed to have landed.
pub fn action_succeeded(action: &Action, perception: &PerceptionSnapshot) -> bool {
    match action {
        Action::MoveTo { x, y } => perception
            .position
            .map(|p| (p.x - x).abs() <= 2 && (p.y - y).abs() <= 2)
            .unwrap_or(false),
        Action::EnterBuilding { building_id } => perception
            .current_building
            .as_ref()
            .map(|b| b.id == *building_id)
            .unwrap_or(false),
        Action::StartConversation { target_id, .. } => perception
            .conversations
            .iter()
            .any(|c| c.participants.iter().any(|p| p == target_id)),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motivation::Desire;
    use crate::perception::{BuildingRef, LiveConversation, Position};

    fn snapshot_at(x: i64, y: i64) -> PerceptionSnapshot {
        PerceptionSnapshot {
            position: Some(Position { x, y }),
            ..PerceptionSnapshot::default()
        }
    }

    #[test]
    fn plan_tracks_the_pending_chain() {
        let motivation = MotivationState::new(Desire::StartBusiness, 0);
        let plan = generate_plan(Some(&motivation), Intent::Work, 1_000);
        assert_eq!(plan.primary_goal, "Land a paying job");
        assert_eq!(
            plan.secondary_goals,
            ["Get the job application approved", "Save up starting capital"]
        );
    }

    #[test]
    fn exhausted_chain_falls_back_to_intent_theme() {
        let mut motivation = MotivationState::new(Desire::StartBusiness, 0);
        for id in ["get_job", "get_votes", "need_capital", "open_business"] {
            motivation.mark_done(id);
        }
        let plan = generate_plan(Some(&motivation), Intent::Leisure, 0);
        assert_eq!(plan.primary_goal, "Explore and unwind");
        assert!(plan.secondary_goals.is_empty());
    }

    #[test]
    fn ensure_plan_is_idempotent_within_the_ttl() {
        let mut plan = None;
        assert!(ensure_plan(&mut plan, None, Intent::Social, DEFAULT_PLAN_TTL_MS, 1_000));
        let first = plan.clone().unwrap();
        assert!(!ensure_plan(
            &mut plan,
            None,
            Intent::Social,
            DEFAULT_PLAN_TTL_MS,
            1_000 + DEFAULT_PLAN_TTL_MS
        ));
        assert_eq!(plan.unwrap().last_plan_at, first.last_plan_at);
    }

    #[test]
    fn ensure_plan_regenerates_after_the_ttl() {
        let mut plan = None;
        ensure_plan(&mut plan, None, Intent::Social, DEFAULT_PLAN_TTL_MS, 0);
        assert!(ensure_plan(
            &mut plan,
            None,
            Intent::Social,
            DEFAULT_PLAN_TTL_MS,
            DEFAULT_PLAN_TTL_MS + 1
        ));
        assert_eq!(plan.unwrap().last_plan_at, DEFAULT_PLAN_TTL_MS + 1);
    }

    #[test]
    fn move_success_tolerates_two_cells() {
        let action = Action::MoveTo { x: 10, y: 10 };
        assert!(action_succeeded(&action, &snapshot_at(12, 8)));
        assert!(!action_succeeded(&action, &snapshot_at(13, 10)));
    }

    #[test]
    fn enter_building_checks_the_current_building() {
        let action = Action::EnterBuilding {
            building_id: "cafe-1".to_string(),
        };
        let mut snap = snapshot_at(0, 0);
        assert!(!action_succeeded(&action, &snap));
        snap.current_building = Some(BuildingRef {
            id: "cafe-1".into(),
            name: "Cafe".into(),
        });
        assert!(action_succeeded(&action, &snap));
    }

    #[test]
    fn conversation_success_requires_the_target_among_participants() {
        let action = Action::StartConversation {
            target_id: "agent-7".into(),
            message: "hola".into(),
        };
        let mut snap = snapshot_at(0, 0);
        assert!(!action_succeeded(&action, &snap));
        snap.conversations.push(LiveConversation {
            id: "c1".into(),
            participants: vec!["me".into(), "agent-7".into()],
            messages: Vec::new(),
            started_at: None,
            last_activity: None,
        });
        assert!(action_succeeded(&action, &snap));
    }

    #[test]
    fn replan_fires_only_after_the_timeout_on_a_failed_action() {
        let mut plan = generate_plan(None, Intent::Work, 0);
        plan.record_action(&Action::MoveTo { x: 50, y: 50 }, 0);
        let snap = snapshot_at(0, 0);
        assert!(!should_replan(&plan, &snap, DEFAULT_ACTION_TIMEOUT_MS, 10_000));
        assert!(should_replan(&plan, &snap, DEFAULT_ACTION_TIMEOUT_MS, 46_000));
        // A move that landed never triggers a replan.
        let near = snapshot_at(49, 51);
        assert!(!should_replan(&plan, &near, DEFAULT_ACTION_TIMEOUT_MS, 46_000));
    }

    #[test]
    fn target_price_freezes_once() {
        let motivation = MotivationState::new(Desire::BuyHouse, 0);
        let mut goal = GoalState::from_motivation(&motivation, 0);
        goal.freeze_target_price(400.0, 1);
        goal.freeze_target_price(900.0, 2);
        assert_eq!(goal.target_price, Some(400.0));
    }
}
