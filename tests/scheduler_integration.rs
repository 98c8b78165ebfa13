//! End-to-end tests against an in-memory SQLite pool, covering the
//! durable-state side of the orchestration engine (crash recovery,
//! budget gating, cancellation, resume) without making any real
//! provider calls.

use std::collections::HashMap;
use std::path::PathBuf;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use swarmforge::agent::AgentRunner;
use swarmforge::cost::CostLedger;
use swarmforge::plan::{Intent, Scope};
use swarmforge::scheduler::PipelineRequest;
use swarmforge::{OrchestratorConfig, Scheduler, Store};

async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();

    sqlx::query(
        "CREATE TABLE pipeline_runs (
            id TEXT PRIMARY KEY, chat_id TEXT, project_id TEXT, project_path TEXT,
            user_message TEXT, intent TEXT, scope TEXT, aborted INTEGER,
            batch_index INTEGER, started_at TEXT
        )",
    )
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query(
        "CREATE TABLE agent_executions (
            id TEXT PRIMARY KEY, pipeline_run_id TEXT, agent_key TEXT, instance_id TEXT,
            status TEXT, input TEXT, depends_on TEXT, retry_count INTEGER,
            output TEXT, error_message TEXT, started_at TEXT, completed_at TEXT
        )",
    )
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query(
        "CREATE TABLE messages (
            id TEXT PRIMARY KEY, chat_id TEXT, role TEXT, content TEXT, created_at TEXT
        )",
    )
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query("CREATE TABLE app_settings (key TEXT PRIMARY KEY, value TEXT)")
        .execute(&pool)
        .await
        .unwrap();

    for table in ["token_usage", "billing_ledger"] {
        let project_col = if table == "billing_ledger" { "project_id TEXT," } else { "" };
        sqlx::query(&format!(
            "CREATE TABLE {table} (
                id TEXT PRIMARY KEY, step_id TEXT, chat_id TEXT, {project_col}
                agent_key TEXT, provider TEXT, model TEXT, api_key_hash TEXT,
                input_tokens INTEGER, output_tokens INTEGER,
                cache_creation_input_tokens INTEGER, cache_read_input_tokens INTEGER,
                estimated INTEGER, cost_estimate REAL, created_at TEXT
            )"
        ))
        .execute(&pool)
        .await
        .unwrap();
    }

    pool
}

fn test_request(pool: SqlitePool, chat_id: &str, cancel: CancellationToken) -> (Scheduler, PipelineRequest) {
    let config = OrchestratorConfig::default();
    let store = Store::new(pool.clone());
    let cost = CostLedger::new(pool, config.clone());
    let runner = AgentRunner::new(config.clone());
    let scheduler = Scheduler::new(store, cost, runner, config);

    let request = PipelineRequest {
        chat_id: chat_id.to_string(),
        project_id: "proj-1".to_string(),
        project_path: PathBuf::from("/tmp/does-not-matter"),
        user_message: "Build a landing page".to_string(),
        chat_history: Vec::new(),
        intent: Intent::Build,
        scope: Scope::Full,
        research_signal: None,
        api_keys: HashMap::new(),
        cancel,
    };
    (scheduler, request)
}

/// Scenario 6 (crash recovery): a `running` row left behind by a killed
/// process is marked `failed` with the documented reason, one system
/// message is inserted per affected chat, and a second cleanup pass is a
/// no-op.
#[tokio::test]
async fn test_crash_recovery_is_idempotent_and_messages_once() {
    let pool = test_pool().await;
    let store = Store::new(pool.clone());

    let run_id = store
        .record_pipeline_start("chat-crash", "proj-1", "/tmp/proj", "Build a landing page", "build", "full")
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO agent_executions \
         (id, pipeline_run_id, agent_key, instance_id, status, input, depends_on, retry_count, \
          output, error_message, started_at, completed_at) \
         VALUES (?, ?, 'architect', NULL, 'running', 'x', '[]', 0, NULL, NULL, datetime('now'), NULL)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(run_id.to_string())
    .execute(&pool)
    .await
    .unwrap();

    let first_pass = store.cleanup_stale_executions().await.unwrap();
    assert_eq!(first_pass, 1);

    let steps = store.list_steps(run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, swarmforge::store::StepStatus::Failed);
    assert_eq!(steps[0].error_message.as_deref(), Some("Server restarted — pipeline interrupted"));

    let message_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE chat_id = 'chat-crash'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(message_count.0, 1);

    let second_pass = store.cleanup_stale_executions().await.unwrap();
    assert_eq!(second_pass, 0);

    let message_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE chat_id = 'chat-crash'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(message_count.0, 1, "cleanup must not message the same chat twice");
}

/// Scenario 6 continuation: `resume` reconstructs `completed`/`outputs`
/// from persisted rows rather than re-dispatching them. A pre-cancelled
/// token lets the reconstruction run without any provider call.
#[tokio::test]
async fn test_resume_reconstructs_completed_steps_without_redispatch() {
    let pool = test_pool().await;
    let store = Store::new(pool.clone());

    let run_id = store
        .record_pipeline_start("chat-resume", "proj-1", "/tmp/proj", "Build a landing page", "build", "full")
        .await
        .unwrap();

    let architect_step = store
        .record_step_start(&swarmforge::store::NewStep {
            pipeline_run_id: run_id,
            agent_key: "architect".to_string(),
            instance_id: None,
            input: "Build a landing page".to_string(),
            depends_on: vec![],
        })
        .await
        .unwrap();
    store.record_step_complete(architect_step, r#"{"files": []}"#).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let (scheduler, _unused) = test_request(pool, "chat-resume", cancel.clone());

    let outcome = scheduler.resume(run_id, "chat-resume".to_string(), HashMap::new(), cancel).await.unwrap();

    assert!(outcome.halted);
    assert_eq!(outcome.halted_reason.as_deref(), Some("cancelled"));
    assert_eq!(outcome.pipeline_run_id, run_id);

    assert!(store.is_pipeline_aborted(run_id).await.unwrap());
}

/// Pre-flight budget gate: a project that has already burned past its
/// cost ceiling never dispatches a single step.
#[tokio::test]
async fn test_run_halts_before_dispatch_when_project_budget_exhausted() {
    let pool = test_pool().await;

    sqlx::query(
        "INSERT INTO billing_ledger \
         (id, step_id, chat_id, project_id, agent_key, provider, model, api_key_hash, \
          input_tokens, output_tokens, cache_creation_input_tokens, cache_read_input_tokens, \
          estimated, cost_estimate, created_at) \
         VALUES (?, ?, 'chat-budget', 'proj-1', 'architect', 'anthropic', 'm', 'hash', \
          1000, 1000, 0, 0, 0, 50.0, datetime('now'))",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(Uuid::new_v4().to_string())
    .execute(&pool)
    .await
    .unwrap();

    let mut config = OrchestratorConfig::default();
    config.max_cost_per_project = 10.0;

    let store = Store::new(pool.clone());
    let cost = CostLedger::new(pool.clone(), config.clone());
    let runner = AgentRunner::new(config.clone());
    let scheduler = Scheduler::new(store, cost, runner, config);

    let (_ignored, mut request) = test_request(pool, "chat-budget", CancellationToken::new());
    request.project_id = "proj-1".to_string();

    let result = scheduler.run(request).await;
    assert!(matches!(result, Err(swarmforge::Error::BudgetExceeded(_))));
}

/// The abort registry is single-writer-per-chat and cleans itself up:
/// once a run terminates (here, via a pre-cancelled token) its chat id
/// is no longer registered, so a later `abort` call reports nothing to
/// signal.
#[tokio::test]
async fn test_abort_registry_cleared_after_run_terminates() {
    let pool = test_pool().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (scheduler, request) = test_request(pool, "chat-abort", cancel);
    let outcome = scheduler.run(request).await.unwrap();
    assert!(outcome.halted);

    assert!(!scheduler.abort("chat-abort"), "registry entry must be removed once the run returns");
}

/// `is_running` reflects whatever `has_active_pipeline` sees in the
/// store: true while a step is non-terminal, false once the run is
/// marked aborted.
#[tokio::test]
async fn test_is_running_tracks_active_pipeline_state() {
    let pool = test_pool().await;
    let store = Store::new(pool.clone());

    let run_id = store
        .record_pipeline_start("chat-status", "proj-1", "/tmp/proj", "Build a landing page", "build", "full")
        .await
        .unwrap();
    store
        .record_step_start(&swarmforge::store::NewStep {
            pipeline_run_id: run_id,
            agent_key: "architect".to_string(),
            instance_id: None,
            input: "x".to_string(),
            depends_on: vec![],
        })
        .await
        .unwrap();

    let config = OrchestratorConfig::default();
    let cost = CostLedger::new(pool.clone(), config.clone());
    let runner = AgentRunner::new(config.clone());
    let scheduler = Scheduler::new(store.clone(), cost, runner, config);

    assert!(scheduler.is_running("chat-status").await.unwrap());

    store.mark_pipeline_aborted(run_id).await.unwrap();
    assert!(!scheduler.is_running("chat-status").await.unwrap());

    let latest = store.latest_pipeline_run("chat-status").await.unwrap();
    assert_eq!(latest, Some(run_id));
}
