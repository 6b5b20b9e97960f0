//! Personality traits that bias every layer of the decision engine.

use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::TraitOverrides;

/// Four bounded scalars in [0, 1]. Derived once per session and stable for
/// a given identity unless a self-authored profile overrides them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraitVector {
    pub ambition: f64,
    pub sociability: f64,
    pub curiosity: f64,
    pub discipline: f64,
}

impl Default for TraitVector {
    fn default() -> Self {
        Self {
            ambition: 0.5,
            sociability: 0.6,
            curiosity: 0.5,
            discipline: 0.5,
        }
    }
}

/// Explicit config values win; otherwise draw a reproducible vector seeded
/// by the identity string so the same citizen always wakes up with the same
/// temperament.
pub fn derive_traits(overrides: Option<&TraitOverrides>, identity: &str) -> TraitVector {
    if let Some(t) = overrides {
        return TraitVector {
            ambition: clamp01(t.ambition),
            sociability: clamp01(t.sociability),
            curiosity: clamp01(t.curiosity),
            discipline: clamp01(t.discipline),
        };
    }

    let seed: u64 = identity.chars().map(|c| c as u64).sum();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut draw = || round2(rng.random_range(0.3..=0.9));
    TraitVector {
        ambition: draw(),
        sociability: draw(),
        curiosity: draw(),
        discipline: draw(),
    }
}

/// Apply a stored profile's `traits` object. All four fields must be present
/// and numeric, otherwise the override is rejected without touching any
/// field.
pub fn apply_profile_override(traits: &mut TraitVector, profile: &serde_json::Value) -> bool {
    let Some(obj) = profile.get("traits").and_then(|t| t.as_object()) else {
        return false;
    };

    let mut values = [0.0f64; 4];
    for (slot, key) in ["ambition", "sociability", "curiosity", "discipline"]
        .iter()
        .enumerate()
    {
        match obj.get(*key).and_then(coerce_float) {
            Some(v) => values[slot] = clamp01(v),
            None => return false,
        }
    }

    traits.ambition = values[0];
    traits.sociability = values[1];
    traits.curiosity = values[2];
    traits.discipline = values[3];
    true
}

fn coerce_float(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_traits_are_deterministic_per_identity() {
        let a = derive_traits(None, "citizen-42");
        let b = derive_traits(None, "citizen-42");
        assert_eq!(a, b);

        let other = derive_traits(None, "citizen-43");
        assert_ne!(a, other);
    }

    #[test]
    fn derived_traits_stay_in_range() {
        for identity in ["a", "bb", "ccc", "a-much-longer-identity-string"] {
            let t = derive_traits(None, identity);
            for v in [t.ambition, t.sociability, t.curiosity, t.discipline] {
                assert!((0.3..=0.9).contains(&v), "{} out of range for {}", v, identity);
                // Rounded to 2 decimals.
                assert_eq!(v, (v * 100.0).round() / 100.0);
            }
        }
    }

    #[test]
    fn explicit_overrides_win_and_are_clamped() {
        let overrides = TraitOverrides {
            ambition: 1.5,
            sociability: -0.2,
            curiosity: 0.7,
            discipline: 0.4,
        };
        let t = derive_traits(Some(&overrides), "whoever");
        assert_eq!(t.ambition, 1.0);
        assert_eq!(t.sociability, 0.0);
        assert_eq!(t.curiosity, 0.7);
    }

    #[test]
    fn profile_override_is_atomic() {
        let mut traits = TraitVector::default();
        let before = traits;

        // Missing discipline: nothing changes.
        let partial = serde_json::json!({
            "traits": {"ambition": 0.9, "sociability": 0.9, "curiosity": 0.9}
        });
        assert!(!apply_profile_override(&mut traits, &partial));
        assert_eq!(traits, before);

        // Non-numeric field: nothing changes.
        let bad = serde_json::json!({
            "traits": {
                "ambition": 0.9, "sociability": 0.9,
                "curiosity": 0.9, "discipline": "often"
            }
        });
        assert!(!apply_profile_override(&mut traits, &bad));
        assert_eq!(traits, before);

        // Complete override applies, including numeric strings.
        let full = serde_json::json!({
            "traits": {
                "ambition": 0.9, "sociability": 0.8,
                "curiosity": "0.7", "discipline": 0.6
            }
        });
        assert!(apply_profile_override(&mut traits, &full));
        assert_eq!(traits.ambition, 0.9);
        assert_eq!(traits.curiosity, 0.7);
    }
}
