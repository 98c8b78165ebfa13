//! Cost/Budget Ledger: write-ahead provisional token tracking, finalized
//! or voided once a step resolves, plus pre-flight and mid-pipeline
//! budget gates.
//!
//! Two tables conceptually: `token_usage` (operational, deleted with its
//! owning chat) and `billing_ledger` (permanent, never deleted). Both are
//! dual-written on every transition so a reconciliation job can recompute
//! historical cost without touching the operational table.

pub mod tokenizer;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::provider::pricing;
use crate::provider::stream::StepUsage;

/// Result of a budget gate check.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub warning: bool,
    pub current: f64,
    pub limit: f64,
}

impl BudgetCheck {
    fn unlimited(current: f64) -> Self {
        Self { allowed: true, warning: false, current, limit: 0.0 }
    }
}

fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Dual-write ledger over a local `SqlitePool`.
#[derive(Clone)]
pub struct CostLedger {
    pool: SqlitePool,
    config: OrchestratorConfig,
}

impl CostLedger {
    pub fn new(pool: SqlitePool, config: OrchestratorConfig) -> Self {
        Self { pool, config }
    }

    /// Insert a provisional record into both tables before dispatch,
    /// estimating token counts from the fully-assembled prompt text.
    pub async fn track_provisional_usage(
        &self,
        step_id: Uuid,
        chat_id: &str,
        project_id: &str,
        agent_key: &str,
        provider: &str,
        model: &str,
        api_key: &str,
        prompt_text: &str,
    ) -> Result<Uuid> {
        let record_id = Uuid::new_v4();
        let input_tokens = tokenizer::estimate_tokens(prompt_text);
        let output_tokens = 0u64;
        let cost = pricing::estimate_cost(provider, model, input_tokens, output_tokens, 0, 0);
        let api_key_hash = hash_api_key(api_key);
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO token_usage \
             (id, step_id, chat_id, agent_key, provider, model, api_key_hash, \
              input_tokens, output_tokens, cache_creation_input_tokens, cache_read_input_tokens, \
              estimated, cost_estimate, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 1, ?, ?)",
        )
        .bind(record_id.to_string())
        .bind(step_id.to_string())
        .bind(chat_id)
        .bind(agent_key)
        .bind(provider)
        .bind(model)
        .bind(&api_key_hash)
        .bind(input_tokens as i64)
        .bind(output_tokens as i64)
        .bind(cost)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO billing_ledger \
             (id, step_id, chat_id, project_id, agent_key, provider, model, api_key_hash, \
              input_tokens, output_tokens, cache_creation_input_tokens, cache_read_input_tokens, \
              estimated, cost_estimate, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 1, ?, ?)",
        )
        .bind(record_id.to_string())
        .bind(step_id.to_string())
        .bind(chat_id)
        .bind(project_id)
        .bind(agent_key)
        .bind(provider)
        .bind(model)
        .bind(&api_key_hash)
        .bind(input_tokens as i64)
        .bind(output_tokens as i64)
        .bind(cost)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| Error::Database(e.to_string()))?;
        Ok(record_id)
    }

    /// Update both rows with exact counts once the Gateway returns real usage.
    pub async fn finalize_token_usage(
        &self,
        record_id: Uuid,
        provider: &str,
        model: &str,
        usage: StepUsage,
    ) -> Result<f64> {
        let cost = pricing::estimate_cost(
            provider,
            model,
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_creation_input_tokens,
            usage.cache_read_input_tokens,
        );

        let mut tx = self.pool.begin().await.map_err(|e| Error::Database(e.to_string()))?;

        for table in ["token_usage", "billing_ledger"] {
            sqlx::query(&format!(
                "UPDATE {table} SET estimated = 0, input_tokens = ?, output_tokens = ?, \
                 cache_creation_input_tokens = ?, cache_read_input_tokens = ?, cost_estimate = ? \
                 WHERE id = ?"
            ))
            .bind(usage.input_tokens as i64)
            .bind(usage.output_tokens as i64)
            .bind(usage.cache_creation_input_tokens as i64)
            .bind(usage.cache_read_input_tokens as i64)
            .bind(cost)
            .bind(record_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| Error::Database(e.to_string()))?;
        Ok(cost)
    }

    /// Delete both rows — used on step failure or cancellation so no
    /// `estimated=1` record survives pipeline termination.
    pub async fn void_provisional_usage(&self, record_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| Error::Database(e.to_string()))?;
        for table in ["token_usage", "billing_ledger"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
                .bind(record_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Sum of finalized + provisional token counts for a chat, gated
    /// against `max_tokens_per_chat`.
    pub async fn check_cost_limit(&self, chat_id: &str) -> Result<BudgetCheck> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) FROM token_usage WHERE chat_id = ?",
        )
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let current = row.0 as f64;
        let limit = self.config.max_tokens_per_chat as f64;
        Ok(self.evaluate(current, limit))
    }

    /// Sum of ledger cost for the current UTC day, gated against `max_cost_per_day`.
    pub async fn check_daily_limit(&self) -> Result<BudgetCheck> {
        if self.config.max_cost_per_day <= 0.0 {
            return Ok(BudgetCheck::unlimited(0.0));
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let row: (f64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(cost_estimate), 0.0) FROM billing_ledger WHERE date(created_at) = ?",
        )
        .bind(today)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(self.evaluate(row.0, self.config.max_cost_per_day))
    }

    /// Sum of ledger cost for a project, gated against `max_cost_per_project`.
    pub async fn check_project_limit(&self, project_id: &str) -> Result<BudgetCheck> {
        if self.config.max_cost_per_project <= 0.0 {
            return Ok(BudgetCheck::unlimited(0.0));
        }

        let row: (f64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(cost_estimate), 0.0) FROM billing_ledger WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(self.evaluate(row.0, self.config.max_cost_per_project))
    }

    fn evaluate(&self, current: f64, limit: f64) -> BudgetCheck {
        if limit <= 0.0 {
            return BudgetCheck::unlimited(current);
        }
        let ratio = current / limit;
        BudgetCheck {
            allowed: ratio < 1.0,
            warning: ratio >= self.config.budget_warning_ratio,
            current,
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
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

    #[tokio::test]
    async fn test_provisional_then_finalize() {
        let ledger = CostLedger::new(test_pool().await, OrchestratorConfig::default());
        let step_id = Uuid::new_v4();
        let record_id = ledger
            .track_provisional_usage(step_id, "chat-1", "proj-1", "architect", "anthropic", "claude-sonnet-4-20250514", "sk-test", "some prompt text")
            .await
            .unwrap();

        let row: (i64,) = sqlx::query_as("SELECT estimated FROM token_usage WHERE id = ?")
            .bind(record_id.to_string())
            .fetch_one(&ledger.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);

        let usage = StepUsage { input_tokens: 500, output_tokens: 200, cache_creation_input_tokens: 0, cache_read_input_tokens: 0 };
        ledger.finalize_token_usage(record_id, "anthropic", "claude-sonnet-4-20250514", usage).await.unwrap();

        let row: (i64, i64) = sqlx::query_as("SELECT estimated, input_tokens FROM token_usage WHERE id = ?")
            .bind(record_id.to_string())
            .fetch_one(&ledger.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
        assert_eq!(row.1, 500);
    }

    #[tokio::test]
    async fn test_void_removes_both_rows() {
        let ledger = CostLedger::new(test_pool().await, OrchestratorConfig::default());
        let step_id = Uuid::new_v4();
        let record_id = ledger
            .track_provisional_usage(step_id, "chat-1", "proj-1", "architect", "anthropic", "m", "sk-test", "x")
            .await
            .unwrap();

        ledger.void_provisional_usage(record_id).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM token_usage WHERE id = ?")
            .bind(record_id.to_string())
            .fetch_one(&ledger.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_check_cost_limit_warns_at_threshold() {
        let mut config = OrchestratorConfig::default();
        config.max_tokens_per_chat = 1_000;
        let ledger = CostLedger::new(test_pool().await, config);
        let step_id = Uuid::new_v4();
        ledger
            .track_provisional_usage(step_id, "chat-1", "proj-1", "architect", "anthropic", "m", "sk-test", &"a".repeat(3_400))
            .await
            .unwrap();

        let check = ledger.check_cost_limit("chat-1").await.unwrap();
        assert!(check.warning);
        assert!(check.allowed);
    }

    #[tokio::test]
    async fn test_check_daily_limit_disabled_by_default() {
        let ledger = CostLedger::new(test_pool().await, OrchestratorConfig::default());
        let check = ledger.check_daily_limit().await.unwrap();
        assert!(check.allowed);
        assert!(!check.warning);
    }
}
