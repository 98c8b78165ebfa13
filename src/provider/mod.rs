//! Provider Gateway: a uniform, streaming call into a chosen LLM with an
//! internal tool-calling loop.
//!
//! `invoke` drives repeated rounds of `stream::stream_completion`,
//! executing any tool calls the model makes via the caller-supplied
//! `ToolDispatch` and feeding the results back in as new messages.

pub mod binding;
pub mod pricing;
pub mod stream;

use async_stream::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use binding::{ModelHandle, ProviderCredentials};
use stream::{FinishReason, Part as StreamPart, StepUsage};

/// One piece of a Gateway invocation, surfaced to the Agent Runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    TextDelta { text: String },
    ReasoningDelta { text: String },
    ToolCall { id: String, name: String, input: Value },
    ToolResult { id: String, name: String, output: Value, success: bool },
    StepFinish { step: u32, finish_reason: FinishReason, usage: StepUsage },
    Error { message: String },
}

/// Anything that can execute a tool call by name and return a JSON result.
/// Implemented by the Tool Sandbox; kept as a trait here so the Gateway
/// has no compile-time dependency on the sandbox's internals.
#[async_trait::async_trait]
pub trait ToolDispatch: Send + Sync {
    async fn call(&self, name: &str, input: Value) -> Result<Value>;
}

/// A provider's advertised tool, in OpenAI function-call schema shape.
pub type ToolSchema = Value;

/// Request parameters for one Gateway invocation.
pub struct InvokeRequest<'a> {
    pub handle: ModelHandle,
    pub credentials: ProviderCredentials,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub tools: Vec<ToolSchema>,
    pub max_output_tokens: u32,
    pub max_tool_steps: u32,
}

/// Run the Gateway's tool loop, yielding `Part`s as they arrive.
///
/// Fails the stream (final `Part::Error`) and then ends if: the model's
/// stream finishes for a non-successful reason (`AgentAborted`), more
/// than `max_tool_steps` tool rounds occur (`ToolLoopExceeded`), or the
/// cancel token trips (`Cancelled`) — in all three cases no partial
/// completion is offered beyond what was already yielded.
pub fn invoke<'a>(
    request: InvokeRequest<'a>,
    dispatch: std::sync::Arc<dyn ToolDispatch>,
    cancel: CancellationToken,
) -> Pin<Box<dyn Stream<Item = Part> + Send + 'a>> {
    Box::pin(stream! {
        let InvokeRequest {
            handle,
            credentials,
            system_prompt,
            user_prompt,
            tools,
            max_output_tokens,
            max_tool_steps,
        } = request;

        let mut messages = vec![
            serde_json::json!({"role": "system", "content": system_prompt}),
            serde_json::json!({"role": "user", "content": user_prompt}),
        ];

        let mut round: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                yield Part::Error { message: "cancelled".to_string() };
                return;
            }

            if round >= max_tool_steps {
                yield Part::Error {
                    message: Error::ToolLoopExceeded(max_tool_steps).to_string(),
                };
                return;
            }
            round += 1;

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let stream_handle = handle.clone();
            let stream_creds = credentials.clone();
            let stream_messages = messages.clone();
            let stream_tools = tools.clone();

            let call = tokio::spawn(async move {
                stream::stream_completion(
                    &stream_handle,
                    &stream_creds,
                    &stream_messages,
                    &stream_tools,
                    max_output_tokens,
                    |part| {
                        let _ = tx.send(part);
                    },
                )
                .await
            });

            while let Some(part) = rx.recv().await {
                match part {
                    StreamPart::TextDelta { text } => yield Part::TextDelta { text },
                    StreamPart::ReasoningDelta { text } => yield Part::ReasoningDelta { text },
                    StreamPart::ToolCallStart { .. } | StreamPart::ToolCallArgsDelta { .. } => {
                        // Low-level deltas; the Agent Runner only needs the
                        // completed tool call, emitted as `StreamPart::ToolCall`.
                    }
                    StreamPart::ToolCall { id, name, input } => {
                        yield Part::ToolCall { id, name, input };
                    }
                    StreamPart::StepFinish { .. } => {}
                }
            }

            let result = match call.await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    yield Part::Error { message: e.to_string() };
                    return;
                }
                Err(e) => {
                    yield Part::Error { message: format!("provider call panicked: {e}") };
                    return;
                }
            };

            if !result.finish_reason.is_successful() {
                yield Part::Error {
                    message: Error::AgentAborted(format!("{:?}", result.finish_reason)).to_string(),
                };
                return;
            }

            for tool_call in &result.tool_calls {
                let output = match dispatch.call(&tool_call.name, tool_call.input.clone()).await {
                    Ok(value) => {
                        yield Part::ToolResult {
                            id: tool_call.id.clone(),
                            name: tool_call.name.clone(),
                            output: value.clone(),
                            success: true,
                        };
                        value
                    }
                    Err(e) => {
                        let err_value = serde_json::json!({"error": e.to_string()});
                        yield Part::ToolResult {
                            id: tool_call.id.clone(),
                            name: tool_call.name.clone(),
                            output: err_value.clone(),
                            success: false,
                        };
                        err_value
                    }
                };

                messages.push(serde_json::json!({
                    "role": "assistant",
                    "tool_calls": [{
                        "id": tool_call.id,
                        "type": "function",
                        "function": {
                            "name": tool_call.name,
                            "arguments": tool_call.input.to_string(),
                        }
                    }]
                }));
                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_call.id,
                    "content": output.to_string(),
                }));
            }

            yield Part::StepFinish {
                step: round,
                finish_reason: result.finish_reason,
                usage: result.usage,
            };

            if result.tool_calls.is_empty() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDispatch;
    #[async_trait::async_trait]
    impl ToolDispatch for NoopDispatch {
        async fn call(&self, _name: &str, _input: Value) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_tool_dispatch_object_safe() {
        let _d: std::sync::Arc<dyn ToolDispatch> = std::sync::Arc::new(NoopDispatch);
    }
}
