//! Intent selection: the weighted mood that drives wandering when nothing
//! more urgent is on the table, plus the fixed hotspot map per intent.

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::perception::{DayPhase, Needs, Position};
use crate::persona::TraitVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Social,
    Work,
    Leisure,
}

// Weight coefficients. Their roles are fixed by design; the values are the
// tuned defaults.
const SOCIAL_BASE: f64 = 0.4;
const SOCIAL_NEED_SCALE: f64 = 0.7;
const SOCIAL_TRAIT_SCALE: f64 = 0.3;
const WORK_BASE: f64 = 0.3;
const WORK_TRAIT_SCALE: f64 = 0.4;
const WORK_MORNING_BONUS: f64 = 0.2;
const LEISURE_BASE: f64 = 0.2;
const LEISURE_TRAIT_SCALE: f64 = 0.4;
const LEISURE_NIGHT_BONUS: f64 = 0.2;

const HUNGER_THRESHOLD: f64 = 60.0;
const HUNGRY_WORK_PENALTY: f64 = 0.7;
const HUNGRY_LEISURE_PENALTY: f64 = 0.6;
const ENERGY_THRESHOLD: f64 = 35.0;
const TIRED_SOCIAL_PENALTY: f64 = 0.7;
const TIRED_WORK_PENALTY: f64 = 0.5;

/// Pure arg-max over the three intent weights. Ties resolve in the order
/// social, work, leisure.
pub fn select_intent(needs: &Needs, traits: &TraitVector, phase: DayPhase) -> Intent {
    let mut social =
        SOCIAL_BASE + (1.0 - needs.social / 100.0) * SOCIAL_NEED_SCALE + traits.sociability * SOCIAL_TRAIT_SCALE;
    let mut work = WORK_BASE
        + traits.discipline * WORK_TRAIT_SCALE
        + if phase == DayPhase::Morning { WORK_MORNING_BONUS } else { 0.0 };
    let mut leisure = LEISURE_BASE
        + traits.curiosity * LEISURE_TRAIT_SCALE
        + if phase == DayPhase::Night { LEISURE_NIGHT_BONUS } else { 0.0 };

    if needs.hunger > HUNGER_THRESHOLD {
        work *= HUNGRY_WORK_PENALTY;
        leisure *= HUNGRY_LEISURE_PENALTY;
    }
    if needs.energy < ENERGY_THRESHOLD {
        social *= TIRED_SOCIAL_PENALTY;
        work *= TIRED_WORK_PENALTY;
    }

    let mut best = (Intent::Social, social);
    for candidate in [(Intent::Work, work), (Intent::Leisure, leisure)] {
        if candidate.1 > best.1 {
            best = candidate;
        }
    }
    best.0
}

struct Hotspot {
    name: &'static str,
    x: i64,
    y: i64,
}

const SOCIAL_HOTSPOTS: &[Hotspot] = &[
    Hotspot { name: "plaza", x: 16, y: 18 },
    Hotspot { name: "cafe", x: 14, y: 8 },
    Hotspot { name: "market", x: 36, y: 28 },
];
const WORK_HOTSPOTS: &[Hotspot] = &[
    Hotspot { name: "cityhall", x: 28, y: 22 },
    Hotspot { name: "shop", x: 30, y: 14 },
    Hotspot { name: "library", x: 24, y: 6 },
];
const LEISURE_HOTSPOTS: &[Hotspot] = &[
    Hotspot { name: "park", x: 40, y: 42 },
    Hotspot { name: "gallery", x: 50, y: 8 },
    Hotspot { name: "library", x: 24, y: 6 },
];

/// Picks destinations for an intent, remembering the last pick so the
/// citizen does not ping-pong to the same spot (avoided with 60%
/// probability).
#[derive(Debug, Default)]
pub struct HotspotPicker {
    last: Option<&'static str>,
}

impl HotspotPicker {
    pub fn pick(&mut self, intent: Intent) -> Position {
        let table = match intent {
            Intent::Social => SOCIAL_HOTSPOTS,
            Intent::Work => WORK_HOTSPOTS,
            Intent::Leisure => LEISURE_HOTSPOTS,
        };

        let mut rng = rand::rng();
        let filtered: Vec<&Hotspot> = match self.last {
            Some(last) if rng.random_bool(0.6) => {
                let without_last: Vec<&Hotspot> =
                    table.iter().filter(|h| h.name != last).collect();
                if without_last.is_empty() {
                    table.iter().collect()
                } else {
                    without_last
                }
            }
            _ => table.iter().collect(),
        };

        // Tables are never empty, so choose always succeeds.
        let choice = filtered
            .choose(&mut rng)
            .copied()
            .unwrap_or(&table[0]);
        self.last = Some(choice.name);
        Position {
            x: choice.x,
            y: choice.y,
        }
    }

    pub fn last_name(&self) -> Option<&'static str> {
        self.last
    }
}
