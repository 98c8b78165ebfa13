//! Process-wide orchestrator configuration, loaded once from the environment.

use std::time::Duration;

/// Tunables for the scheduler, cost ledger and agent runner.
///
/// Every field has a default matching the documented limits; all of them
/// can be overridden via environment variables so an operator never has
/// to rebuild the binary to change a budget.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum retry attempts for a retriable step failure.
    pub max_retries: u32,
    /// Maximum remediation cycles after a failing review.
    pub max_remediation_cycles: u32,
    /// Maximum `save_version` calls a single pipeline run may make.
    pub max_agent_versions_per_run: u32,
    /// Token budget per chat before the pipeline halts.
    pub max_tokens_per_chat: u64,
    /// Daily cost budget in USD; 0 disables the check.
    pub max_cost_per_day: f64,
    /// Per-project cost budget in USD; 0 disables the check.
    pub max_cost_per_project: f64,
    /// Fraction of a budget at which a warning (not a halt) is broadcast.
    pub budget_warning_ratio: f64,
    /// Minimum interval between `thinking=streaming` broadcast publishes.
    pub stream_throttle: Duration,
    /// Maximum number of prior chat messages folded into a prompt.
    pub history_message_cap: usize,
    /// Maximum total characters of chat history folded into a prompt.
    pub history_char_cap: usize,
    /// Maximum characters of an upstream agent output folded into a downstream prompt.
    pub upstream_truncation_chars: usize,
    /// Maximum steps dispatched concurrently within one ready-set batch.
    pub fanout_limit: usize,
    /// Per-tool-call timeout in the sandbox.
    pub tool_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_remediation_cycles: 1,
            max_agent_versions_per_run: 10,
            max_tokens_per_chat: 500_000,
            max_cost_per_day: 0.0,
            max_cost_per_project: 0.0,
            budget_warning_ratio: 0.8,
            stream_throttle: Duration::from_millis(150),
            history_message_cap: 6,
            history_char_cap: 3_000,
            upstream_truncation_chars: 10_000,
            fanout_limit: 4,
            tool_timeout: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration, falling back to defaults for any unset variable.
    ///
    /// Unlike the per-provider API key loader the CLI entrypoint uses,
    /// every field here is optional: an operator who sets nothing gets
    /// the documented defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_u32("ORCHESTRATOR_MAX_RETRIES", defaults.max_retries),
            max_remediation_cycles: env_u32(
                "ORCHESTRATOR_MAX_REMEDIATION_CYCLES",
                defaults.max_remediation_cycles,
            ),
            max_agent_versions_per_run: env_u32(
                "ORCHESTRATOR_MAX_AGENT_VERSIONS_PER_RUN",
                defaults.max_agent_versions_per_run,
            ),
            max_tokens_per_chat: env_u64(
                "ORCHESTRATOR_MAX_TOKENS_PER_CHAT",
                defaults.max_tokens_per_chat,
            ),
            max_cost_per_day: env_f64("ORCHESTRATOR_MAX_COST_PER_DAY", defaults.max_cost_per_day),
            max_cost_per_project: env_f64(
                "ORCHESTRATOR_MAX_COST_PER_PROJECT",
                defaults.max_cost_per_project,
            ),
            budget_warning_ratio: env_f64(
                "ORCHESTRATOR_BUDGET_WARNING_RATIO",
                defaults.budget_warning_ratio,
            ),
            stream_throttle: Duration::from_millis(env_u64(
                "ORCHESTRATOR_STREAM_THROTTLE_MS",
                defaults.stream_throttle.as_millis() as u64,
            )),
            history_message_cap: env_u32(
                "ORCHESTRATOR_HISTORY_MESSAGE_CAP",
                defaults.history_message_cap as u32,
            ) as usize,
            history_char_cap: env_u32(
                "ORCHESTRATOR_HISTORY_CHAR_CAP",
                defaults.history_char_cap as u32,
            ) as usize,
            upstream_truncation_chars: env_u32(
                "ORCHESTRATOR_UPSTREAM_TRUNCATION_CHARS",
                defaults.upstream_truncation_chars as u32,
            ) as usize,
            fanout_limit: env_u32("ORCHESTRATOR_FANOUT_LIMIT", defaults.fanout_limit as u32)
                as usize,
            tool_timeout: Duration::from_secs(env_u64(
                "ORCHESTRATOR_TOOL_TIMEOUT_SECS",
                defaults.tool_timeout.as_secs(),
            )),
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_remediation_cycles, 1);
        assert_eq!(cfg.fanout_limit, 4);
    }

    #[test]
    #[serial]
    fn test_from_env_override() {
        std::env::set_var("ORCHESTRATOR_MAX_RETRIES", "7");
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.max_retries, 7);
        std::env::remove_var("ORCHESTRATOR_MAX_RETRIES");
    }

    #[test]
    #[serial]
    fn test_from_env_default_when_unset() {
        std::env::remove_var("ORCHESTRATOR_FANOUT_LIMIT");
        let cfg = OrchestratorConfig::from_env();
        assert_eq!(cfg.fanout_limit, 4);
    }
}
