//! Process-wide static registry of agent configurations.
//!
//! Agent configs are compile-time data, not something a caller can mutate
//! at runtime — new agents are added here, not constructed dynamically.
//! A pipeline run may still *override* an agent's provider/model for a
//! single run (e.g. an operator testing a new model); overrides are
//! layered on top of this table by the caller and never mutate it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Which phase of the pipeline an agent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentGroup {
    Planning,
    Development,
    Quality,
}

/// Static configuration for one agent key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identifier used as the DAG node key (e.g. "frontend-dev").
    pub agent_key: String,
    /// Human-readable name, used in broadcast events.
    pub display_name: String,
    /// Provider id (must match a registered `ProviderBinding`).
    pub provider: String,
    /// Model id passed through to the provider.
    pub model: String,
    /// Which pipeline phase this agent runs in.
    pub group: AgentGroup,
    /// Output-token cap for a single invocation.
    pub max_output_tokens: u32,
    /// Tool-call round cap for a single invocation.
    pub max_tool_steps: u32,
    /// Whether this agent is currently selectable.
    pub enabled: bool,
}

impl AgentConfig {
    fn new(
        agent_key: &str,
        display_name: &str,
        group: AgentGroup,
        max_output_tokens: u32,
        max_tool_steps: u32,
    ) -> Self {
        Self {
            agent_key: agent_key.to_string(),
            display_name: display_name.to_string(),
            provider: "cerebras".to_string(),
            model: "cerebras/gpt-oss-120b".to_string(),
            group,
            max_output_tokens,
            max_tool_steps,
            enabled: true,
        }
    }
}

/// The built-in agent roster, with the output/tool-step caps from the
/// documented defaults table (research 3k/10, architect 12k/10,
/// frontend-dev 64k/12, backend-dev 32k/8, styling 32k/8, reviewers
/// 2k/10, everything else 8k/10).
pub fn default_agents() -> Vec<AgentConfig> {
    use AgentGroup::*;
    vec![
        AgentConfig::new("orchestrator:classify", "Intent Classifier", Planning, 200, 1),
        AgentConfig::new("research", "Research", Planning, 3_000, 10),
        AgentConfig::new("architect", "Architect", Planning, 12_000, 10),
        AgentConfig::new("frontend-dev", "Frontend Developer", Development, 64_000, 12),
        AgentConfig::new("backend-dev", "Backend Developer", Development, 32_000, 8),
        AgentConfig::new("styling", "Styling", Development, 32_000, 8),
        AgentConfig::new("code-review", "Code Review", Quality, 2_000, 10),
        AgentConfig::new("security", "Security Review", Quality, 2_000, 10),
        AgentConfig::new("qa", "QA Review", Quality, 2_000, 10),
        AgentConfig::new("testing", "Test Runner", Quality, 2_000, 10),
        AgentConfig::new("orchestrator:question", "Question Answering", Planning, 8_000, 10),
        AgentConfig::new("orchestrator:summary", "Summary", Planning, 8_000, 1),
    ]
}

struct Registry {
    agents: HashMap<String, AgentConfig>,
}

impl Registry {
    fn new() -> Self {
        let mut agents = HashMap::new();
        for agent in default_agents() {
            agents.insert(agent.agent_key.clone(), agent);
        }
        Self { agents }
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Look up an agent config by key. Returns a clone since the caller may
/// apply a per-run override on top of it.
pub fn get_agent(agent_key: &str) -> Option<AgentConfig> {
    registry().agents.get(agent_key).cloned()
}

/// List every registered agent, sorted by key for stable output.
pub fn list_agents() -> Vec<AgentConfig> {
    let mut agents: Vec<AgentConfig> = registry().agents.values().cloned().collect();
    agents.sort_by(|a, b| a.agent_key.cmp(&b.agent_key));
    agents
}

/// Per-run override layered over a static `AgentConfig`.
///
/// Only provider/model may be overridden today; caps and group stay
/// fixed so a run can't silently exceed the documented budget table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOverride {
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Apply a set of per-run overrides (keyed by agent_key) to a base config.
pub fn resolve_agent(
    agent_key: &str,
    overrides: &HashMap<String, AgentOverride>,
) -> Option<AgentConfig> {
    let mut cfg = get_agent(agent_key)?;
    if let Some(over) = overrides.get(agent_key) {
        if let Some(provider) = &over.provider {
            cfg.provider = provider.clone();
        }
        if let Some(model) = &over.model {
            cfg.model = model.clone();
        }
    }
    Some(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_agents_nonempty_and_valid() {
        let agents = default_agents();
        assert!(!agents.is_empty());
        for agent in &agents {
            assert!(!agent.agent_key.is_empty());
            assert!(!agent.model.is_empty());
            assert!(agent.max_output_tokens > 0);
        }
    }

    #[test]
    fn test_get_agent_known_and_unknown() {
        assert!(get_agent("frontend-dev").is_some());
        assert!(get_agent("does-not-exist").is_none());
    }

    #[test]
    fn test_caps_match_documented_defaults() {
        let frontend = get_agent("frontend-dev").unwrap();
        assert_eq!(frontend.max_output_tokens, 64_000);
        assert_eq!(frontend.max_tool_steps, 12);

        let review = get_agent("code-review").unwrap();
        assert_eq!(review.max_output_tokens, 2_000);
    }

    #[test]
    fn test_resolve_agent_override() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "frontend-dev".to_string(),
            AgentOverride {
                provider: Some("anthropic".to_string()),
                model: Some("anthropic/claude-sonnet-4-20250514".to_string()),
            },
        );
        let resolved = resolve_agent("frontend-dev", &overrides).unwrap();
        assert_eq!(resolved.provider, "anthropic");
        assert_eq!(resolved.model, "anthropic/claude-sonnet-4-20250514");
        // caps are untouched by the override
        assert_eq!(resolved.max_output_tokens, 64_000);
    }

    #[test]
    fn test_resolve_agent_without_override_matches_default() {
        let overrides = HashMap::new();
        let resolved = resolve_agent("research", &overrides).unwrap();
        let default = get_agent("research").unwrap();
        assert_eq!(resolved.provider, default.provider);
        assert_eq!(resolved.model, default.model);
    }
}
