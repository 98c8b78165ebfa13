//! Prompt assembly for a single agent invocation.
//!
//! Builds the user-turn prompt from chat history, ambient context, and
//! upstream agent outputs, each capped so a long-running pipeline can't
//! blow through a model's context window.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::OrchestratorConfig;

/// One prior chat message folded into the prompt's history section.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Truncate with a head+tail elision marker, matching the upstream
/// truncation behavior applied to every value folded into a downstream
/// prompt.
pub fn truncate_with_marker(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let half = max_chars.saturating_sub(20) / 2;
    let chars: Vec<char> = text.chars().collect();
    let head: String = chars[..half.min(chars.len())].iter().collect();
    let tail_start = chars.len().saturating_sub(half);
    let tail: String = chars[tail_start..].iter().collect();
    format!("{head}\n... [truncated] ...\n{tail}")
}

/// Cap chat history to the most recent N messages and a total character
/// budget, dropping oldest messages first once either limit is hit.
fn render_history(history: &[ChatMessage], cfg: &OrchestratorConfig) -> String {
    if history.is_empty() {
        return String::new();
    }

    let recent: Vec<&ChatMessage> = history
        .iter()
        .rev()
        .take(cfg.history_message_cap)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    let mut budget = cfg.history_char_cap;
    let mut lines = Vec::new();
    for msg in recent.iter().rev() {
        let line = format!("{}: {}", msg.role, msg.content);
        if line.len() > budget {
            break;
        }
        budget -= line.len();
        lines.push(line);
    }
    lines.reverse();
    lines.join("\n")
}

/// Build the full prompt for one agent invocation.
pub fn build_prompt(
    user_message: &str,
    history: &[ChatMessage],
    context: &Value,
    upstream_outputs: &BTreeMap<String, String>,
    cfg: &OrchestratorConfig,
) -> String {
    let mut sections = Vec::new();

    let history_text = render_history(history, cfg);
    if !history_text.is_empty() {
        sections.push(format!("## Chat History\n{history_text}"));
    }

    sections.push(format!(
        "## Context\n{}",
        serde_json::to_string_pretty(context).unwrap_or_default()
    ));

    if !upstream_outputs.is_empty() {
        let mut block = String::from("## Previous Agent Outputs\n");
        for (key, value) in upstream_outputs {
            let truncated = truncate_with_marker(value, cfg.upstream_truncation_chars);
            block.push_str(&format!("### {key}\n{truncated}\n\n"));
        }
        sections.push(block);
    }

    sections.push(format!("## Current Request\n{user_message}"));

    sections.join("\n\n")
}

/// Base system prompt shared by every agent; role-specific guidance is
/// appended by the caller using the agent's own config.
pub const BASE_SYSTEM_PROMPT: &str = r#"You are one agent in a team building a web project together.

<guidelines>
- Be concise; explain what you are doing only when it isn't obvious from a tool call.
- Use the write_file/write_files tools to produce code; do not paste code into your response text.
- Read a file before editing it if you are not sure what it currently contains.
- Stay inside your assigned responsibility; do not redo another agent's work.
</guidelines>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_text_unchanged() {
        assert_eq!(truncate_with_marker("hello", 100), "hello");
    }

    #[test]
    fn test_truncate_long_text_has_marker() {
        let long = "x".repeat(500);
        let truncated = truncate_with_marker(&long, 100);
        assert!(truncated.contains("[truncated]"));
        assert!(truncated.len() < long.len());
    }

    #[test]
    fn test_build_prompt_includes_all_sections() {
        let cfg = OrchestratorConfig::default();
        let history = vec![ChatMessage { role: "user".into(), content: "hi".into() }];
        let mut upstream = BTreeMap::new();
        upstream.insert("architect".to_string(), "plan details".to_string());
        let prompt = build_prompt(
            "Build a landing page",
            &history,
            &serde_json::json!({"scope": "full"}),
            &upstream,
            &cfg,
        );
        assert!(prompt.contains("## Chat History"));
        assert!(prompt.contains("## Context"));
        assert!(prompt.contains("## Previous Agent Outputs"));
        assert!(prompt.contains("### architect"));
        assert!(prompt.contains("## Current Request"));
        assert!(prompt.contains("Build a landing page"));
    }

    #[test]
    fn test_build_prompt_omits_empty_history_and_upstream_sections() {
        let cfg = OrchestratorConfig::default();
        let prompt = build_prompt("hi", &[], &serde_json::json!({}), &BTreeMap::new(), &cfg);
        assert!(!prompt.contains("## Chat History"));
        assert!(!prompt.contains("## Previous Agent Outputs"));
    }

    #[test]
    fn test_history_capped_to_message_count() {
        let cfg = OrchestratorConfig::default();
        let history: Vec<ChatMessage> = (0..20)
            .map(|i| ChatMessage { role: "user".into(), content: format!("msg{i}") })
            .collect();
        let rendered = render_history(&history, &cfg);
        assert!(!rendered.contains("msg0"));
        assert!(rendered.contains("msg19"));
    }
}
