//! Long-horizon motivation: a persistent desire broken into a prerequisite
//! chain of steps. Steps complete only on observable evidence from the
//! world, never on wishful thinking, so the chain doubles as a progress
//! ledger across restarts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::persona::TraitVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Desire {
    BePresident,
    StartBusiness,
    FindLove,
    BuyHouse,
}

impl Desire {
    pub fn as_str(&self) -> &'static str {
        match self {
            Desire::BePresident => "be_president",
            Desire::StartBusiness => "start_business",
            Desire::FindLove => "find_love",
            Desire::BuyHouse => "buy_house",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub requires: Vec<String>,
    pub status: StepStatus,
}

impl Step {
    fn new(id: &str, label: &str, requires: &[&str]) -> Self {
        Step {
            id: id.to_string(),
            label: label.to_string(),
            requires: requires.iter().map(|r| r.to_string()).collect(),
            status: StepStatus::Pending,
        }
    }
}

/// Evidence gathered each cycle from perception and memory. Step completion
/// is driven entirely by these fields.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    pub has_job: bool,
    pub balance: f64,
    pub target_price: Option<f64>,
    pub approval_ratio: f64,
    pub approving_count: usize,
    pub max_trust: i64,
    pub is_candidate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotivationState {
    pub desire: Desire,
    pub chain: Vec<Step>,
    pub started_at: i64,
}

impl MotivationState {
    /// Builds the chain for a desire. Declaration steps (no prerequisites)
    /// are marked done immediately: declaring an ambition is not something
    /// the world can confirm later.
    pub fn new(desire: Desire, now: i64) -> Self {
        let chain = match desire {
            Desire::BePresident => vec![
                Step::new("desire_president", "Declare the ambition to lead the town", &[]),
                Step::new("build_reputation", "Earn a positive reputation with neighbors", &["desire_president"]),
                Step::new("help_citizens", "Win over several citizens through favors", &["build_reputation"]),
                Step::new("register_candidate", "Register as a political candidate", &["help_citizens"]),
                Step::new("win_votes", "Campaign for votes", &["register_candidate"]),
            ],
            Desire::StartBusiness => vec![
                Step::new("desire_business", "Decide to open a business", &[]),
                Step::new("get_job", "Land a paying job", &["desire_business"]),
                Step::new("get_votes", "Get the job application approved", &["get_job"]),
                Step::new("need_capital", "Save up starting capital", &["get_votes"]),
                Step::new("open_business", "Buy a commercial property", &["need_capital"]),
            ],
            Desire::FindLove => vec![
                Step::new("desire_date", "Decide to look for a partner", &[]),
                Step::new("build_relationship", "Build trust with someone special", &["desire_date"]),
                Step::new("get_job", "Land a paying job", &["build_relationship"]),
                Step::new("get_votes", "Get the job application approved", &["get_job"]),
                Step::new("need_money", "Save enough for a proper date", &["get_votes"]),
                Step::new("plan_date", "Plan the date itself", &["need_money"]),
            ],
            Desire::BuyHouse => vec![
                Step::new("desire_house", "Decide to become a homeowner", &[]),
                Step::new("get_job", "Land a paying job", &["desire_house"]),
                Step::new("get_votes", "Get the job application approved", &["get_job"]),
                Step::new("build_support", "Befriend neighbors who can help", &["get_votes"]),
                Step::new("need_money", "Save toward the asking price", &["get_votes"]),
                Step::new("buy_house", "Buy a house on the market", &["need_money"]),
            ],
        };
        let mut state = MotivationState {
            desire,
            chain,
            started_at: now,
        };
        for step in &mut state.chain {
            if step.requires.is_empty() {
                step.status = StepStatus::Done;
            }
        }
        state
    }

    fn is_done(&self, id: &str) -> bool {
        self.chain
            .iter()
            .any(|s| s.id == id && s.status == StepStatus::Done)
    }

    /// A step is ready when all of its prerequisites are done.
    pub fn is_ready(&self, step: &Step) -> bool {
        step.requires.iter().all(|r| self.is_done(r))
    }

    /// Marks a step done only if it exists, is pending, and its
    /// prerequisites are satisfied. Returns whether anything changed.
    pub fn mark_done(&mut self, id: &str) -> bool {
        let ready = self
            .chain
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.status == StepStatus::Pending && self.is_ready(s))
            .unwrap_or(false);
        if !ready {
            return false;
        }
        if let Some(step) = self.chain.iter_mut().find(|s| s.id == id) {
            step.status = StepStatus::Done;
            info!(desire = self.desire.as_str(), step = %id, "motivation step completed");
            return true;
        }
        false
    }

    /// First pending step whose prerequisites are met.
    pub fn next_step(&self) -> Option<&Step> {
        self.chain
            .iter()
            .find(|s| s.status == StepStatus::Pending && self.is_ready(s))
    }

    pub fn is_exhausted(&self) -> bool {
        self.chain.iter().all(|s| s.status == StepStatus::Done)
    }

    /// Applies world/memory evidence to the chain, completing whatever
    /// steps the evidence supports. Runs to a fixpoint so a single tick can
    /// unlock a later step whose prerequisite was proven the same tick.
    pub fn update_progress(&mut self, evidence: &Evidence) -> bool {
        let mut changed = false;
        loop {
            let ids: Vec<String> = self
                .chain
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .map(|s| s.id.clone())
                .collect();
            let mut progressed = false;
            for id in ids {
                if step_is_proven(&id, evidence) && self.mark_done(&id) {
                    progressed = true;
                    changed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        changed
    }
}

fn step_is_proven(id: &str, ev: &Evidence) -> bool {
    match id {
        "get_job" | "get_votes" => ev.has_job,
        "need_money" | "need_capital" => ev
            .target_price
            .map(|price| ev.balance >= price)
            .unwrap_or(false),
        "build_reputation" => ev.approval_ratio >= 0.2 && ev.approving_count >= 1,
        "help_citizens" | "build_support" => ev.approving_count >= 2,
        "build_relationship" => ev.max_trust >= 2,
        "register_candidate" => ev.is_candidate,
        // Terminal steps (win_votes, open_business, buy_house, plan_date)
        // have no passive evidence; the chain may legitimately never
        // exhaust.
        _ => false,
    }
}

/// Derives a starting desire from the citizen's profile goals when present,
/// otherwise from temperament.
pub fn infer_desire(profile: Option<&Value>, traits: &TraitVector) -> Desire {
    if let Some(goals) = profile
        .and_then(|p| p.get("goals"))
        .and_then(|g| g.as_array())
    {
        let text = goals
            .iter()
            .filter_map(|g| g.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| text.contains(w));
        if any(&["president", "alcald", "polit"]) {
            return Desire::BePresident;
        }
        if any(&["negocio", "empresa", "emprend", "tienda", "cafe"]) {
            return Desire::StartBusiness;
        }
        if any(&["cita", "amor", "pareja", "romance"]) {
            return Desire::FindLove;
        }
        if any(&["casa", "hogar", "vivienda"]) {
            return Desire::BuyHouse;
        }
    }

    if traits.ambition >= 0.75 {
        Desire::BePresident
    } else if traits.curiosity >= 0.7 {
        Desire::StartBusiness
    } else {
        Desire::BuyHouse
    }
}
