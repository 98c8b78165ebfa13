//! swarmforge CLI - command-line entrypoint for the build orchestrator.

use std::collections::HashMap;
use std::env;

use clap::Parser;
use sqlx::sqlite::SqlitePool;

use swarmforge::agent::AgentRunner;
use swarmforge::cli::types::Cli;
use swarmforge::cost::CostLedger;
use swarmforge::provider::binding::ProviderCredentials;
use swarmforge::{OrchestratorConfig, Scheduler, Store};

/// Provider ids this binary knows how to load credentials for, matching
/// the bindings registered in `provider::binding`.
const PROVIDER_IDS: &[&str] = &["anthropic", "openai", "google", "xai", "deepseek", "mistral", "cerebras"];

/// Build the `apiKeys` map `runOrchestration`/`resumeOrchestration` expect,
/// reading one `<PROVIDER>_API_KEY` env var per registered provider.
/// Providers without a key set are simply absent from the map; dispatch
/// against them fails with `ProviderUnavailable` rather than at startup.
fn api_keys_from_env() -> HashMap<String, ProviderCredentials> {
    let mut keys = HashMap::new();
    for provider_id in PROVIDER_IDS {
        let env_key = format!("{}_API_KEY", provider_id.to_uppercase());
        if let Ok(api_key) = env::var(&env_key) {
            let proxy_url = env::var(format!("{}_PROXY_URL", provider_id.to_uppercase())).ok();
            keys.insert(provider_id.to_string(), ProviderCredentials { api_key, proxy_url });
        }
    }
    keys
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    let _ = dotenv::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    swarmforge::bus::init();

    let observability_config = swarmforge::observability::ObservabilityConfig::default();
    if let Err(err) = swarmforge::observability::init(observability_config) {
        tracing::warn!("observability init failed, continuing without metrics: {err}");
    }

    // Get database URL from environment. Schema migration is out of scope
    // for this crate; the tables are assumed to already exist.
    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://swarmforge.db".to_string());
    let pool = SqlitePool::connect(&database_url).await?;

    let config = OrchestratorConfig::from_env();
    let store = Store::new(pool.clone());
    let cost = CostLedger::new(pool, config.clone());
    let runner = AgentRunner::new(config.clone());
    let scheduler = Scheduler::new(store.clone(), cost, runner, config);

    scheduler.recover_stale_executions().await?;

    let cli = Cli::parse();
    let api_keys = api_keys_from_env();

    swarmforge::cli::run(cli, scheduler, store, api_keys).await
}
