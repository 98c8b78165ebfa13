//! Agent Runner: loads an agent's config and prompt, wraps the Provider
//! Gateway with throttled broadcast updates, per-agent output/step caps,
//! summary extraction, and file-write tracking.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       AgentRunner                         │
//! │  1. Resolve agent config + provider binding               │
//! │  2. Build prompt (history + context + upstream outputs)   │
//! │  3. publish(agent_status=running, thinking=started)       │
//! │  4. Drive provider::invoke()'s Part stream:                │
//! │       text-delta  -> throttled thinking=streaming         │
//! │       tool-call   -> thinking update (paths only)         │
//! │       tool-result -> track files_written                  │
//! │       step-finish -> accumulate usage                     │
//! │  5. publish(agent_status=completed, thinking=completed)   │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod prompt;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::{self, AgentStatus, Event, ThinkingStatus, ToolCallSummary};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::extract;
use crate::provider::binding::{ModelHandle, ProviderCredentials};
use crate::provider::stream::{FinishReason, StepUsage};
use crate::provider::{self, InvokeRequest, Part};
use crate::registry::AgentConfig;
use crate::tools::ToolSandbox;

pub use prompt::ChatMessage;

/// Token usage accumulated across every tool-loop round of one invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregatedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl AggregatedUsage {
    fn add(&mut self, step: StepUsage) {
        self.input_tokens += step.input_tokens;
        self.output_tokens += step.output_tokens;
        self.cache_creation_input_tokens += step.cache_creation_input_tokens;
        self.cache_read_input_tokens += step.cache_read_input_tokens;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Everything an invocation needs besides the resolved provider/model.
pub struct AgentInput {
    pub user_message: String,
    pub chat_history: Vec<ChatMessage>,
    pub context: Value,
    pub upstream_outputs: BTreeMap<String, String>,
}

/// What one invocation produced.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub content: String,
    pub summary: String,
    pub files_written: Vec<String>,
    pub usage: AggregatedUsage,
    pub finish_reason: FinishReason,
}

/// Wraps the Provider Gateway with the ambient behavior every agent
/// invocation needs: broadcast updates, prompt assembly, and summary
/// extraction.
#[derive(Clone)]
pub struct AgentRunner {
    cfg: OrchestratorConfig,
}

impl AgentRunner {
    pub fn new(cfg: OrchestratorConfig) -> Self {
        Self { cfg }
    }

    /// Invoke one agent. `instance_id` distinguishes parallel copies of
    /// the same agent (e.g. `frontend-dev-components-1`) on the bus;
    /// when `None` the agent's own key is used.
    #[allow(clippy::too_many_arguments)]
    pub async fn invoke(
        &self,
        agent: &AgentConfig,
        chat_id: &str,
        project_id: &str,
        instance_id: Option<&str>,
        input: AgentInput,
        handle: ModelHandle,
        credentials: ProviderCredentials,
        sandbox: Arc<ToolSandbox>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let bus_name = instance_id.unwrap_or(&agent.agent_key).to_string();

        bus::publish(Event::AgentStatus {
            chat_id: chat_id.to_string(),
            agent_name: bus_name.clone(),
            status: AgentStatus::Running,
            detail: None,
        });
        bus::publish(Event::AgentThinking {
            chat_id: chat_id.to_string(),
            agent_name: bus_name.clone(),
            display_name: agent.display_name.clone(),
            status: ThinkingStatus::Started,
            chunk: None,
            summary: None,
            tool_call: None,
        });

        let system_prompt = prompt::BASE_SYSTEM_PROMPT.to_string();
        let user_prompt = prompt::build_prompt(
            &input.user_message,
            &input.chat_history,
            &input.context,
            &input.upstream_outputs,
            &self.cfg,
        );

        let request = InvokeRequest {
            handle,
            credentials,
            system_prompt: &system_prompt,
            user_prompt: &user_prompt,
            tools: crate::tools::tool_definitions(),
            max_output_tokens: agent.max_output_tokens,
            max_tool_steps: agent.max_tool_steps,
        };

        let fallback_sandbox = sandbox.clone();
        let dispatch: Arc<dyn provider::ToolDispatch> = sandbox;
        let mut part_stream = provider::invoke(request, dispatch, cancel);

        let mut full_text = String::new();
        let mut files_written = Vec::new();
        let mut usage = AggregatedUsage::default();
        let mut finish_reason = FinishReason::Stop;
        let mut error_message: Option<String> = None;
        let mut last_publish = Instant::now()
            .checked_sub(self.cfg.stream_throttle)
            .unwrap_or_else(Instant::now);

        while let Some(part) = part_stream.next().await {
            match part {
                Part::TextDelta { text } => {
                    full_text.push_str(&text);
                    if last_publish.elapsed() >= self.cfg.stream_throttle {
                        bus::publish(Event::AgentThinking {
                            chat_id: chat_id.to_string(),
                            agent_name: bus_name.clone(),
                            display_name: agent.display_name.clone(),
                            status: ThinkingStatus::Streaming,
                            chunk: Some(text),
                            summary: None,
                            tool_call: None,
                        });
                        last_publish = Instant::now();
                    }
                }
                Part::ReasoningDelta { .. } => {}
                Part::ToolCall { name, input, .. } => {
                    let paths = extract_tool_paths(&name, &input);
                    bus::publish(Event::AgentThinking {
                        chat_id: chat_id.to_string(),
                        agent_name: bus_name.clone(),
                        display_name: agent.display_name.clone(),
                        status: ThinkingStatus::Streaming,
                        chunk: None,
                        summary: None,
                        tool_call: Some(ToolCallSummary { tool_name: name, paths }),
                    });
                }
                Part::ToolResult { name, output, success, .. } => {
                    if success {
                        files_written.extend(extract_written_paths(&name, &output));
                    }
                }
                Part::StepFinish { finish_reason: fr, usage: step_usage, .. } => {
                    usage.add(step_usage);
                    finish_reason = fr;
                }
                Part::Error { message } => {
                    error_message = Some(message);
                }
            }
        }

        if let Some(message) = error_message {
            bus::publish(Event::AgentStatus {
                chat_id: chat_id.to_string(),
                agent_name: bus_name.clone(),
                status: AgentStatus::Failed,
                detail: Some(message.clone()),
            });
            bus::publish(Event::AgentThinking {
                chat_id: chat_id.to_string(),
                agent_name: bus_name.clone(),
                display_name: agent.display_name.clone(),
                status: ThinkingStatus::Failed,
                chunk: None,
                summary: None,
                tool_call: None,
            });
            bus::publish(Event::AgentError {
                chat_id: chat_id.to_string(),
                agent_name: bus_name,
                error: message.clone(),
            });
            return Err(Error::AgentAborted(message));
        }

        if files_written.is_empty() {
            for file in extract::extract_files(&full_text) {
                if fallback_sandbox.write_file(&file.path, &file.content).await.is_ok() {
                    files_written.push(file.path);
                }
            }
        }

        let content = strip_trailing_json_block(&full_text);
        let summary = extract_summary(&content);

        if !files_written.is_empty() {
            bus::publish(Event::FilesChanged {
                project_id: project_id.to_string(),
                files: files_written.clone(),
            });
        }

        bus::publish(Event::AgentThinking {
            chat_id: chat_id.to_string(),
            agent_name: bus_name.clone(),
            display_name: agent.display_name.clone(),
            status: ThinkingStatus::Completed,
            chunk: None,
            summary: Some(summary.clone()),
            tool_call: None,
        });
        bus::publish(Event::AgentStatus {
            chat_id: chat_id.to_string(),
            agent_name: bus_name,
            status: AgentStatus::Completed,
            detail: None,
        });

        Ok(AgentOutcome {
            content,
            summary,
            files_written,
            usage,
            finish_reason,
        })
    }
}

fn extract_tool_paths(name: &str, input: &Value) -> Vec<String> {
    match name {
        "write_file" | "read_file" => input
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| vec![p.to_string()])
            .unwrap_or_default(),
        "write_files" => input
            .get("files")
            .and_then(|v| v.as_array())
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| f.get("path").and_then(|p| p.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn extract_written_paths(name: &str, output: &Value) -> Vec<String> {
    match name {
        "write_file" => output
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| vec![p.to_string()])
            .unwrap_or_default(),
        "write_files" => output
            .get("paths")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|p| p.as_str()).map(str::to_string).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Strip a trailing fenced or bare JSON summary block some agents (e.g.
/// research, architect) append to their free-text response.
fn strip_trailing_json_block(text: &str) -> String {
    let trimmed = text.trim_end();
    if let Some(idx) = trimmed.rfind("```json") {
        return trimmed[..idx].trim_end().to_string();
    }
    trimmed.to_string()
}

/// Derive a short one-line summary (<=120 chars) for UI display: first
/// sentence of the response, falling back to a flat truncation.
fn extract_summary(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let first_sentence = trimmed
        .split(['.', '\n'])
        .next()
        .unwrap_or(trimmed)
        .trim();

    let candidate = if first_sentence.is_empty() { trimmed } else { first_sentence };

    if candidate.chars().count() <= 120 {
        candidate.to_string()
    } else {
        let truncated: String = candidate.chars().take(117).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tool_paths_write_file() {
        let input = serde_json::json!({"path": "src/App.tsx", "content": "x"});
        assert_eq!(extract_tool_paths("write_file", &input), vec!["src/App.tsx"]);
    }

    #[test]
    fn test_extract_tool_paths_write_files() {
        let input = serde_json::json!({"files": [{"path": "a.ts"}, {"path": "b.ts"}]});
        assert_eq!(extract_tool_paths("write_files", &input), vec!["a.ts", "b.ts"]);
    }

    #[test]
    fn test_extract_written_paths_write_files() {
        let output = serde_json::json!({"success": true, "paths": ["a.ts", "b.ts"]});
        assert_eq!(extract_written_paths("write_files", &output), vec!["a.ts", "b.ts"]);
    }

    #[test]
    fn test_strip_trailing_json_block() {
        let text = "Here is my plan.\n```json\n{\"features\": []}\n```";
        assert_eq!(strip_trailing_json_block(text), "Here is my plan.");
    }

    #[test]
    fn test_extract_summary_short_text() {
        assert_eq!(extract_summary("Built the landing page."), "Built the landing page");
    }

    #[test]
    fn test_extract_summary_caps_at_120_chars() {
        let long = "a".repeat(300);
        let summary = extract_summary(&long);
        assert!(summary.chars().count() <= 120);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_extract_summary_empty_text() {
        assert_eq!(extract_summary("   "), "");
    }

    #[test]
    fn test_aggregated_usage_sums_across_rounds() {
        let mut usage = AggregatedUsage::default();
        usage.add(StepUsage { input_tokens: 10, output_tokens: 5, cache_creation_input_tokens: 0, cache_read_input_tokens: 0 });
        usage.add(StepUsage { input_tokens: 20, output_tokens: 8, cache_creation_input_tokens: 1, cache_read_input_tokens: 2 });
        assert_eq!(usage.input_tokens, 30);
        assert_eq!(usage.output_tokens, 13);
        assert_eq!(usage.total_tokens(), 43);
    }
}
