//! Decision core for an autonomous MOLTVILLE citizen.
//!
//! A citizen connects to the town server, perceives the world on a fixed
//! cadence, and picks one action per cycle from three stacked layers: a
//! long-horizon motivation chain, a TTL'd tactical plan, and a heuristic
//! ladder. An optional oracle (any OpenAI-compatible completion endpoint)
//! can lead the decision instead; everything it proposes passes through a
//! single validation boundary before touching the world.

pub mod action;
pub mod config;
pub mod heuristic;
pub mod intent;
pub mod memory;
pub mod motivation;
pub mod oracle;
pub mod perception;
pub mod persona;
pub mod plan;
pub mod scheduler;
pub mod session;
pub mod world;

pub use config::CitizenConfig;
pub use scheduler::Citizen;
pub use world::{HttpWorld, WorldEvent, WorldTransport};
