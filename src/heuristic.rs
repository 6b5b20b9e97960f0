//! Heuristic decision ladder: what the citizen does when no oracle and no
//! motivation step dictates an action. Ordered from most to least urgent.

use anyhow::Result;
use rand::Rng;
use tracing::info;

use crate::action::Action;
use crate::config::CitizenConfig;
use crate::perception::PerceptionSnapshot;
use crate::session::AgentSession;
use crate::world::WorldTransport;

/// Opportunistic candidate self-registration. Runs on every heuristic tick;
/// registers at most once per session.
pub async fn maybe_register_candidate(
    session: &mut AgentSession,
    world: &dyn WorldTransport,
    config: &CitizenConfig,
) -> Result<()> {
    if session.political_candidate {
        return Ok(());
    }
    if session.traits.ambition < config.behavior.candidate_ambition_min {
        return Ok(());
    }
    if session.memory.approval_ratio() < config.behavior.candidate_approval_min {
        return Ok(());
    }
    let platform = "Impulsar MOLTVILLE con comunidad y crecimiento local.";
    world
        .register_candidate(&config.agent.name, platform)
        .await?;
    session.political_candidate = true;
    info!("registered as political candidate");
    Ok(())
}

/// The ladder. Always yields an action; `Wait` is the floor.
pub async fn heuristic_decision(
    session: &mut AgentSession,
    perception: &PerceptionSnapshot,
    world: &dyn WorldTransport,
    config: &CitizenConfig,
    now: i64,
) -> Result<Action> {
    if let Err(error) = maybe_register_candidate(session, world, config).await {
        tracing::debug!("candidate registration failed: {}", error);
    }

    // 1. Most urgent pushed goal that names a place.
    let mut goals: Vec<_> = session.active_goals.iter().collect();
    goals.sort_by(|a, b| {
        b.urgency
            .partial_cmp(&a.urgency)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for goal in goals {
        let Some(location) = &goal.location else { continue };
        if let (Some(building_id), Some(current)) =
            (&location.building_id, &perception.current_building)
        {
            if &current.id == building_id {
                let event_name = goal
                    .event
                    .as_ref()
                    .and_then(|e| e.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("");
                return Ok(Action::Speak {
                    message: format!("Llegué al evento {}.", event_name),
                });
            }
        }
        if let (Some(x), Some(y)) = (location.x, location.y) {
            return Ok(Action::MoveTo { x, y });
        }
    }

    // 2. First suggested need with a matching building nearby.
    for suggestion in &perception.suggested_goals {
        let target = perception
            .nearby_buildings
            .iter()
            .find(|b| suggestion.target_types.contains(&b.building_type));
        if let Some(building) = target {
            if let Some(current) = &perception.current_building {
                if current.id == building.id {
                    return Ok(Action::Speak {
                        message: format!("Necesitaba {} y ya estoy aquí.", suggestion.goal_type),
                    });
                }
            }
            let point = building.approach_point();
            return Ok(Action::MoveTo {
                x: point.x,
                y: point.y,
            });
        }
    }

    // 3. Broke and unemployed: apply somewhere.
    if perception.balance() < config.behavior.low_balance_threshold && !perception.has_job() {
        let jobs = world.list_jobs().await.unwrap_or_default();
        if let Some(open) = jobs.iter().find(|j| j.assigned_to.is_none()) {
            return Ok(Action::ApplyJob {
                job_id: open.id.clone(),
            });
        }
    }

    let Some(position) = perception.position else {
        return Ok(Action::Wait {});
    };

    // 4. Follow the current intent to a hotspot.
    let intent = session.intent(
        &perception.needs,
        perception.day_phase(),
        (config.behavior.intent_ttl_base_secs * 1000) as i64,
        (config.behavior.intent_ttl_jitter_secs * 1000) as i64,
        now,
    );
    let hotspot = session.hotspots.pick(intent);
    if hotspot.x != position.x || hotspot.y != position.y {
        return Ok(Action::MoveTo {
            x: hotspot.x,
            y: hotspot.y,
        });
    }

    // 5. Already at the hotspot: jitter around it.
    let mut rng = rand::rng();
    let mut dx: i64 = rng.random_range(-2..=2);
    let dy: i64 = rng.random_range(-2..=2);
    if dx == 0 && dy == 0 {
        dx = 1;
    }
    Ok(Action::MoveTo {
        x: position.x + dx,
        y: position.y + dy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, RelationshipJudgment};
    use crate::perception::{
        ActiveGoal, BuildingRef, EconomyContext, GoalLocation, NearbyBuilding, Position,
        SuggestedGoal, WorldContext,
    };
    use crate::persona::TraitVector;
    use crate::world::mock::MockWorld;
    use crate::world::JobPosting;
    use tempfile::tempdir;

    fn session() -> AgentSession {
        let dir = tempdir().unwrap();
        let memory = MemoryStore::load(dir.path().join("mem.json"));
        AgentSession::new(TraitVector::default(), memory)
    }

    fn base_snapshot() -> PerceptionSnapshot {
        PerceptionSnapshot {
            position: Some(Position { x: 5, y: 5 }),
            context: WorldContext {
                economy: EconomyContext {
                    balance: 100.0,
                    job: None,
                },
            },
            ..PerceptionSnapshot::default()
        }
    }

    #[tokio::test]
    async fn urgent_goal_location_wins_the_ladder() {
        let mut s = session();
        s.active_goals.push(ActiveGoal {
            urgency: 0.2,
            location: Some(GoalLocation {
                x: Some(1),
                y: Some(1),
                building_id: None,
            }),
            ..ActiveGoal::default()
        });
        s.active_goals.push(ActiveGoal {
            urgency: 0.9,
            location: Some(GoalLocation {
                x: Some(30),
                y: Some(40),
                building_id: None,
            }),
            ..ActiveGoal::default()
        });
        let world = MockWorld::with_snapshot(base_snapshot());
        let config = CitizenConfig::default();
        let action = heuristic_decision(&mut s, &base_snapshot(), &world, &config, 0)
            .await
            .unwrap();
        assert_eq!(action, Action::MoveTo { x: 30, y: 40 });
    }

    #[tokio::test]
    async fn arriving_at_the_goal_building_speaks() {
        let mut s = session();
        s.active_goals.push(ActiveGoal {
            urgency: 1.0,
            location: Some(GoalLocation {
                x: None,
                y: None,
                building_id: Some("hall-1".into()),
            }),
            event: Some(serde_json::json!({ "name": "asamblea" })),
            ..ActiveGoal::default()
        });
        let mut snap = base_snapshot();
        snap.current_building = Some(BuildingRef {
            id: "hall-1".into(),
            name: "City Hall".into(),
        });
        let world = MockWorld::with_snapshot(snap.clone());
        let config = CitizenConfig::default();
        let action = heuristic_decision(&mut s, &snap, &world, &config, 0)
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::Speak {
                message: "Llegué al evento asamblea.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn suggested_goal_routes_to_a_matching_building() {
        let mut s = session();
        let mut snap = base_snapshot();
        snap.suggested_goals.push(SuggestedGoal {
            goal_type: "comida".into(),
            target_types: vec!["restaurant".into()],
        });
        snap.nearby_buildings.push(NearbyBuilding {
            id: "rest-1".into(),
            name: "La Cantina".into(),
            building_type: "restaurant".into(),
            position: Some(Position { x: 10, y: 20 }),
            width: 4,
            height: 3,
        });
        let world = MockWorld::with_snapshot(snap.clone());
        let config = CitizenConfig::default();
        let action = heuristic_decision(&mut s, &snap, &world, &config, 0)
            .await
            .unwrap();
        // Footprint point: x + w/2, y + h.
        assert_eq!(action, Action::MoveTo { x: 12, y: 23 });
    }

    #[tokio::test]
    async fn broke_and_jobless_applies_to_the_first_open_job() {
        let mut s = session();
        let mut snap = base_snapshot();
        snap.context.economy.balance = 3.0;
        let world = MockWorld::with_snapshot(snap.clone());
        world.jobs.lock().unwrap().extend([
            JobPosting {
                id: "job-taken".into(),
                assigned_to: Some("someone".into()),
                ..JobPosting::default()
            },
            JobPosting {
                id: "job-open".into(),
                ..JobPosting::default()
            },
        ]);
        let config = CitizenConfig::default();
        let action = heuristic_decision(&mut s, &snap, &world, &config, 0)
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::ApplyJob {
                job_id: "job-open".into()
            }
        );
    }

    #[tokio::test]
    async fn idle_citizen_heads_for_an_intent_hotspot() {
        let mut s = session();
        let snap = base_snapshot();
        let world = MockWorld::with_snapshot(snap.clone());
        let config = CitizenConfig::default();
        let action = heuristic_decision(&mut s, &snap, &world, &config, 0)
            .await
            .unwrap();
        assert!(matches!(action, Action::MoveTo { .. }));
    }

    #[tokio::test]
    async fn candidate_registration_requires_ambition_and_approval() {
        let mut s = session();
        s.traits.ambition = 0.9;
        // Two trusted relationships out of two → approval 1.0.
        for id in ["a1", "a2"] {
            s.memory.apply_relationship_judgment(
                id,
                "gracias",
                &RelationshipJudgment {
                    affinity_delta: 2,
                    trust_delta: 2,
                    respect_delta: 0,
                    note: "aliado".into(),
                },
            );
        }
        let snap = base_snapshot();
        let world = MockWorld::with_snapshot(snap.clone());
        let config = CitizenConfig::default();
        let _ = heuristic_decision(&mut s, &snap, &world, &config, 0).await;
        assert!(s.political_candidate);
        assert!(world
            .recorded()
            .iter()
            .any(|c| c.starts_with("register_candidate:")));
    }

    #[tokio::test]
    async fn low_ambition_never_registers() {
        let mut s = session();
        s.traits.ambition = 0.3;
        let snap = base_snapshot();
        let world = MockWorld::with_snapshot(snap.clone());
        let config = CitizenConfig::default();
        let _ = heuristic_decision(&mut s, &snap, &world, &config, 0).await;
        assert!(!s.political_candidate);
    }
}
