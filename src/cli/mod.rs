//! CLI module - command-line interface for the orchestrator.
//!
//! This is a synchronous wrapper for manual/demo invocation, not the
//! primary entrypoint: the web UI drives `runOrchestration` et al.
//! directly against a long-lived `Scheduler`.

pub mod types;

use std::collections::HashMap;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::plan::{Intent, Scope};
use crate::provider::binding::ProviderCredentials;
use crate::scheduler::{PipelineOutcome, PipelineRequest, Scheduler};
use crate::store::Store;
use types::{Cli, Commands, IntentArg, ScopeArg};

impl From<IntentArg> for Intent {
    fn from(value: IntentArg) -> Self {
        match value {
            IntentArg::Build => Intent::Build,
            IntentArg::Fix => Intent::Fix,
            IntentArg::Question => Intent::Question,
        }
    }
}

impl From<ScopeArg> for Scope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Frontend => Scope::Frontend,
            ScopeArg::Backend => Scope::Backend,
            ScopeArg::Styling => Scope::Styling,
            ScopeArg::Full => Scope::Full,
        }
    }
}

/// Run the CLI application.
pub async fn run(
    cli: Cli,
    scheduler: Scheduler,
    store: Store,
    api_keys: HashMap<String, ProviderCredentials>,
) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run { chat, project, project_path, message, intent, scope } => {
            let project_path = PathBuf::from(project_path);

            let (resolved_intent, resolved_scope) = match (intent, scope) {
                (Some(i), Some(s)) => (i.into(), s.into()),
                (Some(i), None) => (i.into(), Scope::Full),
                (None, Some(s)) => (Intent::Build, s.into()),
                (None, None) => scheduler.classify(&chat, &project_path, &message, &api_keys).await,
            };

            println!("Starting pipeline run (intent={resolved_intent:?}, scope={resolved_scope:?})...");

            let request = PipelineRequest {
                chat_id: chat,
                project_id: project,
                project_path,
                user_message: message,
                chat_history: Vec::new(),
                intent: resolved_intent,
                scope: resolved_scope,
                research_signal: None,
                api_keys,
                cancel: CancellationToken::new(),
            };

            let outcome = scheduler.run(request).await?;
            print_outcome(&outcome);
        }

        Commands::Resume { chat, pipeline_run } => {
            let pipeline_run_id = Uuid::parse_str(&pipeline_run)
                .map_err(|e| format!("invalid --pipeline-run id: {e}"))?;

            println!("Resuming pipeline run {pipeline_run_id}...");

            let outcome = scheduler.resume(pipeline_run_id, chat, api_keys, CancellationToken::new()).await?;
            print_outcome(&outcome);
        }

        Commands::Abort { chat } => {
            if scheduler.abort(&chat) {
                println!("Abort signaled for chat {chat}.");
            } else {
                println!("No in-flight pipeline run found for chat {chat}.");
            }
        }

        Commands::Status { chat } => {
            let running = scheduler.is_running(&chat).await?;
            println!("chat {chat}: {}", if running { "running" } else { "idle" });

            if let Some(pipeline_run_id) = store.latest_pipeline_run(&chat).await? {
                println!("latest pipeline run: {pipeline_run_id}");
                let steps = store.list_steps(pipeline_run_id).await?;
                println!("{:<28} {:<16} {:<10} {:<6}", "agent", "instance", "status", "retries");
                for step in &steps {
                    println!(
                        "{:<28} {:<16} {:<10} {:<6}",
                        step.agent_key,
                        step.instance_id.as_deref().unwrap_or("-"),
                        step.status.to_string(),
                        step.retry_count,
                    );
                }
            } else {
                println!("no pipeline runs recorded for this chat.");
            }
        }
    }

    Ok(())
}

fn print_outcome(outcome: &PipelineOutcome) {
    println!("pipeline run: {}", outcome.pipeline_run_id);
    if outcome.halted {
        println!("halted: {}", outcome.halted_reason.as_deref().unwrap_or("unknown reason"));
        return;
    }

    if let Some(remediation) = &outcome.remediation {
        println!(
            "remediation ran {} cycle(s), resolved={}, paused={}",
            remediation.cycles_run, remediation.resolved, remediation.paused
        );
    }

    match &outcome.summary {
        Some(summary) => println!("\n{summary}"),
        None => println!("completed without a final summary."),
    }
}
