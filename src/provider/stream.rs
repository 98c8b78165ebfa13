//! Single-call SSE streaming against a provider's OpenAI-compatible
//! chat-completions endpoint.
//!
//! One call to `stream_completion` covers exactly one round of the tool
//! loop; `provider::invoke` (in `mod.rs`) drives repeated calls and sums
//! usage across rounds, since a single round's usage undercounts a
//! multi-step tool-calling agent.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::binding::{with_provider_auth, ModelHandle, ProviderCredentials};

/// One piece of a streamed completion, surfaced to the Agent Runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolCallStart { id: String, name: String },
    ToolCallArgsDelta { id: String, args_delta: String },
    ToolCall { id: String, name: String, input: Value },
    StepFinish { finish_reason: FinishReason, usage: Option<StepUsage> },
    Error { message: String },
}

/// Why a single streamed round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other,
}

impl FinishReason {
    /// Per the Gateway contract: `length`, `stop`, `tool_calls` are
    /// successful; everything else (`error`, `other`) is fatal.
    pub fn is_successful(&self) -> bool {
        !matches!(self, FinishReason::Other)
    }
}

/// Token usage for one streamed round.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// A fully-accumulated tool call once its argument stream has closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Accumulated result of one streamed round.
#[derive(Debug, Clone)]
pub struct StreamResult {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: StepUsage,
}

/// Errors from a single streaming call.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Provider error (status {status}): {message}")]
    ProviderError { status: u16, message: String },
}

/// Stream one round of a chat completion, invoking `emit` for every part
/// as it arrives and returning the accumulated result once the stream
/// closes.
pub async fn stream_completion<F>(
    handle: &ModelHandle,
    creds: &ProviderCredentials,
    messages: &[Value],
    tools: &[Value],
    max_output_tokens: u32,
    mut emit: F,
) -> Result<StreamResult, StreamError>
where
    F: FnMut(Part),
{
    let mut body = serde_json::json!({
        "model": handle.model,
        "messages": messages,
        "stream": true,
        "max_tokens": max_output_tokens,
    });

    if !tools.is_empty() {
        body["tools"] = serde_json::json!(tools);
        body["tool_choice"] = serde_json::json!("auto");
    }

    let client = crate::http_client::streaming_client();
    let request = with_provider_auth(client.post(&handle.base_url), handle, creds)
        .header("Content-Type", "application/json")
        .json(&body);

    let response = request
        .send()
        .await
        .map_err(|e| StreamError::Connection(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        return Err(StreamError::ProviderError { status, message });
    }

    let mut bytes_stream = response.bytes_stream();
    let mut buffer = String::new();

    let mut full_content = String::new();
    let mut reasoning_content = String::new();

    let mut tool_calls_map: HashMap<i64, (String, String, String)> = HashMap::new();
    let mut tool_calls_started: HashSet<i64> = HashSet::new();

    let mut usage = StepUsage::default();
    let mut finish_reason = FinishReason::Stop;

    while let Some(chunk) = bytes_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "provider stream interrupted");
                break;
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer = buffer[line_end + 1..].to_string();

            if line.is_empty() || !line.starts_with("data: ") {
                continue;
            }

            let data = &line[6..];
            if data == "[DONE]" {
                break;
            }

            let Ok(json) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            if let Some(choice) = json.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) {
                if let Some(delta) = choice.get("delta") {
                    if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                        if !content.is_empty() {
                            full_content.push_str(content);
                            emit(Part::TextDelta { text: content.to_string() });
                        }
                    }

                    if let Some(reasoning) = delta.get("reasoning_content").and_then(|r| r.as_str()) {
                        if !reasoning.is_empty() {
                            reasoning_content.push_str(reasoning);
                            emit(Part::ReasoningDelta { text: reasoning.to_string() });
                        }
                    }

                    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                        for tc in tool_calls {
                            let idx = tc.get("index").and_then(|i| i.as_i64()).unwrap_or(0);
                            let tc_id = tc.get("id").and_then(|i| i.as_str()).unwrap_or("");

                            if let Some(function) = tc.get("function") {
                                let name = function.get("name").and_then(|n| n.as_str()).unwrap_or("");
                                let args = function.get("arguments").and_then(|a| a.as_str()).unwrap_or("");

                                let entry = tool_calls_map
                                    .entry(idx)
                                    .or_insert_with(|| (tc_id.to_string(), String::new(), String::new()));

                                if !tc_id.is_empty() {
                                    entry.0 = tc_id.to_string();
                                }
                                if !name.is_empty() {
                                    entry.1 = name.to_string();
                                }
                                entry.2.push_str(args);

                                if !tc_id.is_empty() && !name.is_empty() && !tool_calls_started.contains(&idx) {
                                    tool_calls_started.insert(idx);
                                    emit(Part::ToolCallStart { id: tc_id.to_string(), name: name.to_string() });
                                }

                                if !args.is_empty() && tool_calls_started.contains(&idx) {
                                    emit(Part::ToolCallArgsDelta {
                                        id: entry.0.clone(),
                                        args_delta: args.to_string(),
                                    });
                                }
                            }
                        }
                    }
                }

                if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
                    finish_reason = match reason {
                        "tool_calls" => FinishReason::ToolCalls,
                        "length" => FinishReason::Length,
                        "content_filter" => FinishReason::ContentFilter,
                        "stop" => FinishReason::Stop,
                        _ => FinishReason::Other,
                    };
                }
            }

            if let Some(usage_obj) = json.get("usage") {
                usage.input_tokens = usage_obj.get("prompt_tokens").and_then(|t| t.as_u64()).unwrap_or(0);
                usage.output_tokens =
                    usage_obj.get("completion_tokens").and_then(|t| t.as_u64()).unwrap_or(0);
                usage.cache_creation_input_tokens = usage_obj
                    .get("cache_creation_input_tokens")
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0);
                usage.cache_read_input_tokens = usage_obj
                    .get("cache_read_input_tokens")
                    .or_else(|| usage_obj.get("prompt_tokens_details").and_then(|d| d.get("cached_tokens")))
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0);
            }
        }
    }

    let tool_calls: Vec<ToolCall> = tool_calls_map
        .into_values()
        .filter(|(id, name, _)| !id.is_empty() && !name.is_empty())
        .map(|(id, name, args_str)| {
            let input = parse_tool_arguments(&id, &name, &args_str);
            emit(Part::ToolCall { id: id.clone(), name: name.clone(), input: input.clone() });
            ToolCall { id, name, input }
        })
        .collect();

    emit(Part::StepFinish { finish_reason, usage: Some(usage) });

    Ok(StreamResult {
        content: full_content,
        reasoning: reasoning_content,
        tool_calls,
        finish_reason,
        usage,
    })
}

/// Repairs a known upstream defect: some providers stream a tool call's
/// `input` as a stringified JSON blob instead of well-formed JSON. We
/// try a strict parse, then a reparse with common over-escaping
/// repaired, and finally fall back to `{}` with a loud warning — retrying
/// would not help, since the model itself truncated mid-object.
fn parse_tool_arguments(id: &str, name: &str, args_str: &str) -> Value {
    if args_str.trim().is_empty() {
        return Value::Object(Default::default());
    }

    if let Ok(value) = serde_json::from_str::<Value>(args_str) {
        return value;
    }

    let repaired = args_str.replace("\\\"", "\"").replace("\n", "\\n");
    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        tracing::warn!(tool_id = %id, tool_name = %name, "repaired malformed tool-call arguments");
        return value;
    }

    tracing::warn!(
        tool_id = %id,
        tool_name = %name,
        raw = %args_str,
        "unparseable tool-call arguments, substituting empty object"
    );
    Value::Object(Default::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_arguments_valid_json() {
        let v = parse_tool_arguments("t1", "write_file", r#"{"path":"a.ts"}"#);
        assert_eq!(v["path"], "a.ts");
    }

    #[test]
    fn test_parse_tool_arguments_empty_falls_back() {
        let v = parse_tool_arguments("t1", "write_file", "");
        assert_eq!(v, Value::Object(Default::default()));
    }

    #[test]
    fn test_parse_tool_arguments_garbage_falls_back_without_panic() {
        let v = parse_tool_arguments("t1", "write_file", "{not json at all");
        assert_eq!(v, Value::Object(Default::default()));
    }

    #[test]
    fn test_finish_reason_success_classification() {
        assert!(FinishReason::Stop.is_successful());
        assert!(FinishReason::ToolCalls.is_successful());
        assert!(FinishReason::Length.is_successful());
        assert!(!FinishReason::Other.is_successful());
    }
}
