//! Execution Record Store: durable persistence for pipeline runs and
//! steps, backed by a plain `SqlitePool` against tables assumed to
//! already exist (`agent_executions`, `pipeline_runs`, `token_usage`,
//! `billing_ledger`, `messages`, `app_settings`). No `sqlx::migrate!`
//! call lives in this crate — schema ownership is external.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Terminal/non-terminal status of one scheduled step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Stopped,
}

impl StepStatus {
    /// Completed and failed are terminal; a step never leaves them (§8 invariant 7).
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Stopped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A freshly-dispatched step, as recorded by `record_step_start`.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub pipeline_run_id: Uuid,
    pub agent_key: String,
    pub instance_id: Option<String>,
    pub input: String,
    pub depends_on: Vec<Uuid>,
}

/// One persisted step row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    pub id: String,
    pub pipeline_run_id: String,
    pub agent_key: String,
    pub instance_id: Option<String>,
    pub status: StepStatus,
    pub input: String,
    pub depends_on: String,
    pub retry_count: i64,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One persisted pipeline run row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineRunRecord {
    pub id: String,
    pub chat_id: String,
    pub project_id: String,
    pub project_path: String,
    pub user_message: String,
    pub intent: String,
    pub scope: String,
    pub aborted: bool,
    pub batch_index: i64,
    pub started_at: DateTime<Utc>,
}

/// SQLite-backed persistence for pipeline runs and their steps.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new Pipeline Run row.
    pub async fn record_pipeline_start(
        &self,
        chat_id: &str,
        project_id: &str,
        project_path: &str,
        user_message: &str,
        intent: &str,
        scope: &str,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO pipeline_runs \
             (id, chat_id, project_id, project_path, user_message, intent, scope, aborted, batch_index, started_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?)",
        )
        .bind(id.to_string())
        .bind(chat_id)
        .bind(project_id)
        .bind(project_path)
        .bind(user_message)
        .bind(intent)
        .bind(scope)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(id)
    }

    /// Insert a step row with status `running` at dispatch time.
    pub async fn record_step_start(&self, step: &NewStep) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let depends_on = serde_json::to_string(&step.depends_on)?;

        sqlx::query(
            "INSERT INTO agent_executions \
             (id, pipeline_run_id, agent_key, instance_id, status, input, depends_on, retry_count, started_at) \
             VALUES (?, ?, ?, ?, 'running', ?, ?, 0, ?)",
        )
        .bind(id.to_string())
        .bind(step.pipeline_run_id.to_string())
        .bind(&step.agent_key)
        .bind(&step.instance_id)
        .bind(&step.input)
        .bind(depends_on)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(id)
    }

    /// Transition a step to `retrying(attempt)`, bumping its retry count.
    pub async fn record_step_retry(&self, step_id: Uuid, attempt: u32) -> Result<()> {
        sqlx::query(
            "UPDATE agent_executions SET status = 'retrying', retry_count = ? WHERE id = ? AND status NOT IN ('completed', 'failed', 'stopped')",
        )
        .bind(attempt as i64)
        .bind(step_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Move a retried step back to `running` for its next attempt.
    pub async fn record_step_running(&self, step_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE agent_executions SET status = 'running' WHERE id = ? AND status NOT IN ('completed', 'failed', 'stopped')",
        )
        .bind(step_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Mark a step `completed` with its final output. Terminal: never re-opened.
    pub async fn record_step_complete(&self, step_id: Uuid, output: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE agent_executions SET status = 'completed', output = ?, completed_at = ? \
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'stopped')",
        )
        .bind(output)
        .bind(now)
        .bind(step_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Mark a step `failed` with an error message. Terminal: never re-opened.
    pub async fn record_step_failed(&self, step_id: Uuid, err: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE agent_executions SET status = 'failed', error_message = ?, completed_at = ? \
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'stopped')",
        )
        .bind(err)
        .bind(now)
        .bind(step_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Mark a step `stopped` (cancellation mid-flight). Terminal: never re-opened.
    pub async fn record_step_stopped(&self, step_id: Uuid) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE agent_executions SET status = 'stopped', completed_at = ? \
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'stopped')",
        )
        .bind(now)
        .bind(step_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn list_steps(&self, pipeline_run_id: Uuid) -> Result<Vec<StepRecord>> {
        sqlx::query_as::<_, StepRecord>(
            "SELECT id, pipeline_run_id, agent_key, instance_id, status, input, depends_on, \
             retry_count, output, error_message, started_at, completed_at \
             FROM agent_executions WHERE pipeline_run_id = ?",
        )
        .bind(pipeline_run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// On boot: mark every row still `running`/`retrying` as `failed`,
    /// and insert one system message per affected chat. Idempotent — a
    /// second call finds no matching rows and is a no-op (§8 invariant 5).
    pub async fn cleanup_stale_executions(&self) -> Result<u64> {
        const REASON: &str = "Server restarted — pipeline interrupted";
        let now = Utc::now();

        let affected_chats: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT pr.chat_id \
             FROM agent_executions ae \
             JOIN pipeline_runs pr ON pr.id = ae.pipeline_run_id \
             WHERE ae.status IN ('running', 'retrying')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE agent_executions SET status = 'failed', error_message = ?, completed_at = ? \
             WHERE status IN ('running', 'retrying')",
        )
        .bind(REASON)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        for (chat_id,) in affected_chats {
            self.insert_system_message(&chat_id, REASON).await?;
        }

        Ok(result.rows_affected())
    }

    /// Find the most recent pipeline run for a chat whose last step was
    /// left mid-flight (i.e. not every step reached a terminal status).
    pub async fn find_interrupted_pipeline_run(&self, chat_id: &str) -> Result<Option<Uuid>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT pr.id FROM pipeline_runs pr \
             WHERE pr.chat_id = ? AND EXISTS ( \
               SELECT 1 FROM agent_executions ae \
               WHERE ae.pipeline_run_id = pr.id \
               AND ae.status NOT IN ('completed', 'failed', 'stopped') \
             ) \
             ORDER BY pr.started_at DESC LIMIT 1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.map(|(id,)| Uuid::parse_str(&id).map_err(|e| Error::Other(e.to_string())))
            .transpose()
    }

    /// Insert a system message into a chat's message history.
    pub async fn insert_system_message(&self, chat_id: &str, content: &str) -> Result<()> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO messages (id, chat_id, role, content, created_at) VALUES (?, ?, 'system', ?, ?)",
        )
        .bind(id.to_string())
        .bind(chat_id)
        .bind(content)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Mark a pipeline run aborted, so the Scheduler stops dispatching new batches.
    pub async fn mark_pipeline_aborted(&self, pipeline_run_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE pipeline_runs SET aborted = 1 WHERE id = ?")
            .bind(pipeline_run_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn is_pipeline_aborted(&self, pipeline_run_id: Uuid) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT aborted FROM pipeline_runs WHERE id = ?")
            .bind(pipeline_run_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.0)
    }

    /// A key-value app setting, e.g. a cached classifier verdict or feature flag.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Fetch a single Pipeline Run row, e.g. to rebuild its DAG on resume.
    pub async fn get_pipeline_run(&self, pipeline_run_id: Uuid) -> Result<PipelineRunRecord> {
        sqlx::query_as::<_, PipelineRunRecord>(
            "SELECT id, chat_id, project_id, project_path, user_message, intent, scope, \
             aborted, batch_index, started_at FROM pipeline_runs WHERE id = ?",
        )
        .bind(pipeline_run_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Whether a chat currently has a pipeline run with any non-terminal step.
    pub async fn has_active_pipeline(&self, chat_id: &str) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS ( \
               SELECT 1 FROM pipeline_runs pr \
               JOIN agent_executions ae ON ae.pipeline_run_id = pr.id \
               WHERE pr.chat_id = ? AND pr.aborted = 0 \
               AND ae.status NOT IN ('completed', 'failed', 'stopped') \
             )",
        )
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.0)
    }

    /// Most recent pipeline run for a chat, regardless of its status.
    pub async fn latest_pipeline_run(&self, chat_id: &str) -> Result<Option<Uuid>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM pipeline_runs WHERE chat_id = ? ORDER BY started_at DESC LIMIT 1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        row.map(|(id,)| Uuid::parse_str(&id).map_err(|e| Error::Other(e.to_string()))).transpose()
    }
}
