use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Explicit trait values. When present, all four are used verbatim and the
/// deterministic draw is skipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TraitOverrides {
    pub ambition: f64,
    pub sociability: f64,
    pub curiosity: f64,
    pub discipline: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_avatar")]
    pub avatar: String,
    #[serde(default = "default_personality")]
    pub personality: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub traits: Option<TraitOverrides>,
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            avatar: default_avatar(),
            personality: default_personality(),
            id: None,
            traits: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// "heuristic" or "oracle".
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_decision_interval")]
    pub decision_interval_secs: u64,
    #[serde(default = "default_plan_ttl")]
    pub plan_ttl_secs: u64,
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_conversation_cooldown")]
    pub conversation_cooldown_secs: u64,
    #[serde(default = "default_conversation_stale")]
    pub conversation_stale_secs: u64,
    #[serde(default = "default_relation_cooldown")]
    pub relation_cooldown_secs: u64,
    #[serde(default = "default_intent_ttl_base")]
    pub intent_ttl_base_secs: u64,
    #[serde(default = "default_intent_ttl_jitter")]
    pub intent_ttl_jitter_secs: u64,
    #[serde(default = "default_memory_path")]
    pub memory_path: String,
    #[serde(default = "default_profile_push")]
    pub profile_push_secs: u64,
    #[serde(default = "default_low_balance")]
    pub low_balance_threshold: f64,
    #[serde(default = "default_candidate_ambition")]
    pub candidate_ambition_min: f64,
    #[serde(default = "default_candidate_approval")]
    pub candidate_approval_min: f64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            decision_interval_secs: default_decision_interval(),
            plan_ttl_secs: default_plan_ttl(),
            action_timeout_secs: default_action_timeout(),
            conversation_cooldown_secs: default_conversation_cooldown(),
            conversation_stale_secs: default_conversation_stale(),
            relation_cooldown_secs: default_relation_cooldown(),
            intent_ttl_base_secs: default_intent_ttl_base(),
            intent_ttl_jitter_secs: default_intent_ttl_jitter(),
            memory_path: default_memory_path(),
            profile_push_secs: default_profile_push(),
            low_balance_threshold: default_low_balance(),
            candidate_ambition_min: default_candidate_ambition(),
            candidate_approval_min: default_candidate_approval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_url")]
    pub api_url: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_url: default_oracle_url(),
            model: default_oracle_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitizenConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentIdentity,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
}

fn default_server_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_agent_name() -> String {
    "Citizen".to_string()
}

fn default_avatar() -> String {
    "🙂".to_string()
}

fn default_personality() -> String {
    "friendly and curious".to_string()
}

fn default_mode() -> String {
    "heuristic".to_string()
}

fn default_decision_interval() -> u64 {
    20
}

fn default_plan_ttl() -> u64 {
    180
}

fn default_action_timeout() -> u64 {
    45
}

fn default_conversation_cooldown() -> u64 {
    6
}

fn default_conversation_stale() -> u64 {
    120
}

fn default_relation_cooldown() -> u64 {
    8
}

fn default_intent_ttl_base() -> u64 {
    240
}

fn default_intent_ttl_jitter() -> u64 {
    180
}

fn default_memory_path() -> String {
    "moltville_memory.json".to_string()
}

fn default_profile_push() -> u64 {
    20
}

fn default_low_balance() -> f64 {
    5.0
}

fn default_candidate_ambition() -> f64 {
    0.7
}

fn default_candidate_approval() -> f64 {
    0.2
}

fn default_oracle_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_oracle_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f64 {
    0.4
}

fn default_max_tokens() -> u32 {
    300
}

impl CitizenConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file, next to the executable.
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("moltville_config.toml")
    }

    /// Load from moltville_config.toml; missing or unparseable files fall
    /// back to defaults layered with environment variables.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<CitizenConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config back to disk. Used when the server rotates the API key.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("MOLTVILLE_SERVER_URL") {
            config.server.url = url;
        }

        if let Ok(key) = env::var("MOLTVILLE_API_KEY") {
            config.server.api_key = key;
        }

        if let Ok(name) = env::var("AGENT_NAME") {
            config.agent.name = name;
        }

        if let Ok(id) = env::var("AGENT_ID") {
            if !id.trim().is_empty() {
                config.agent.id = Some(id);
            }
        }

        if let Ok(mode) = env::var("AGENT_MODE") {
            config.behavior.mode = mode;
        }

        if let Ok(interval) = env::var("AGENT_DECISION_INTERVAL") {
            if let Ok(seconds) = interval.parse() {
                config.behavior.decision_interval_secs = seconds;
            }
        }

        if let Ok(path) = env::var("AGENT_MEMORY_PATH") {
            if !path.trim().is_empty() {
                config.behavior.memory_path = path;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.oracle.api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.oracle.model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.oracle.api_key = Some(key);
        }

        config
    }

    pub fn oracle_enabled(&self) -> bool {
        self.behavior.mode.eq_ignore_ascii_case("oracle")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_tuned_timings() {
        let config = CitizenConfig::default();
        assert_eq!(config.behavior.decision_interval_secs, 20);
        assert_eq!(config.behavior.plan_ttl_secs, 180);
        assert_eq!(config.behavior.action_timeout_secs, 45);
        assert_eq!(config.behavior.conversation_stale_secs, 120);
        assert_eq!(config.behavior.relation_cooldown_secs, 8);
        assert!(!config.oracle_enabled());
    }

    #[test]
    fn partial_toml_fills_the_rest_with_defaults() {
        let parsed: CitizenConfig = toml::from_str(
            r#"
            [server]
            url = "http://example.test:9000"
            api_key = "secret"

            [behavior]
            mode = "oracle"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.server.url, "http://example.test:9000");
        assert!(parsed.oracle_enabled());
        assert_eq!(parsed.behavior.plan_ttl_secs, 180);
        assert_eq!(parsed.oracle.model, default_oracle_model());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = CitizenConfig::default();
        config.agent.traits = Some(TraitOverrides {
            ambition: 0.8,
            sociability: 0.4,
            curiosity: 0.6,
            discipline: 0.7,
        });
        let text = toml::to_string_pretty(&config).unwrap();
        let back: CitizenConfig = toml::from_str(&text).unwrap();
        let traits = back.agent.traits.unwrap();
        assert!((traits.ambition - 0.8).abs() < f64::EPSILON);
        assert_eq!(back.behavior.memory_path, config.behavior.memory_path);
    }
}
