//! Broadcast bus: the single channel through which the orchestrator tells
//! the outside world what is happening.
//!
//! The actual transport (WebSocket fan-out to browser clients) lives
//! outside this crate. Internally we only need a process-wide publish
//! point: tests and the CLI can subscribe directly, a server binary can
//! bridge `subscribe()` onto WebSocket frames. The handle is set once at
//! boot (mirroring the registry's `OnceLock` pattern); until it is set,
//! `publish` is a no-op so unit tests never need to wire one up.

use serde::Serialize;
use std::sync::OnceLock;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

static BUS: OnceLock<broadcast::Sender<Event>> = OnceLock::new();

/// Status of an agent's overall step, as broadcast on `agent_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Retrying,
    Completed,
    Failed,
    Paused,
    Stopped,
    Warning,
}

/// Status of an agent's in-flight thinking/streaming, as broadcast on `agent_thinking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStatus {
    Started,
    Streaming,
    Completed,
    Failed,
}

/// A tool call summary surfaced alongside a thinking update (path only, never content).
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallSummary {
    pub tool_name: String,
    pub paths: Vec<String>,
}

/// One event published on the bus. Tagged by `type` in the wire format so
/// external subscribers can dispatch on a single JSON field, matching the
/// shapes enumerated in the external-interfaces contract.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AgentStatus {
        chat_id: String,
        agent_name: String,
        status: AgentStatus,
        detail: Option<String>,
    },
    AgentThinking {
        chat_id: String,
        agent_name: String,
        display_name: String,
        status: ThinkingStatus,
        chunk: Option<String>,
        summary: Option<String>,
        tool_call: Option<ToolCallSummary>,
    },
    AgentStream {
        chat_id: String,
        agent_name: String,
        chunk: String,
    },
    AgentError {
        chat_id: String,
        agent_name: String,
        error: String,
    },
    FilesChanged {
        project_id: String,
        files: Vec<String>,
    },
    TokenUsage {
        chat_id: String,
        agent_name: String,
        provider: String,
        model: String,
        input_tokens: u64,
        output_tokens: u64,
        cache_creation_input_tokens: Option<u64>,
        cache_read_input_tokens: Option<u64>,
        total_tokens: u64,
        cost_estimate: f64,
    },
    ChatMessage {
        chat_id: String,
        agent_name: String,
        content: String,
    },
    PipelineHalted {
        chat_id: String,
        failed_agent: String,
        reason: String,
    },
}

/// Initialize the process-wide bus. Idempotent: a second call is a no-op.
pub fn init() {
    let _ = BUS.get_or_init(|| broadcast::channel(CHANNEL_CAPACITY).0);
}

/// Publish an event. Silently dropped if nobody has subscribed, and a
/// no-op (not a panic) if `init()` was never called — matching the
/// "broadcast handle unset => publish is a no-op" design note.
pub fn publish(event: Event) {
    if let Some(tx) = BUS.get() {
        let _ = tx.send(event);
    }
}

/// Subscribe to the bus. Returns `None` if `init()` has not run yet.
pub fn subscribe() -> Option<broadcast::Receiver<Event>> {
    BUS.get().map(|tx| tx.subscribe())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_init_is_noop() {
        // Can't easily unset a OnceLock once another test has called init(),
        // so this just asserts publish never panics either way.
        publish(Event::ChatMessage {
            chat_id: "c1".into(),
            agent_name: "orchestrator".into(),
            content: "hello".into(),
        });
    }

    #[test]
    fn test_publish_and_subscribe() {
        init();
        let mut rx = subscribe().expect("bus initialized");
        publish(Event::PipelineHalted {
            chat_id: "c1".into(),
            failed_agent: "frontend-dev".into(),
            reason: "boom".into(),
        });
        let got = rx.try_recv();
        assert!(got.is_ok());
    }
}
