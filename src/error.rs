//! Error types for the orchestrator.

use thiserror::Error;

/// Main error type for the orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    /// Database-related errors (execution record store, token ledger).
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration errors (missing/invalid environment variables).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No step, pipeline run, or agent config found for the given id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No provider binding is registered for the requested provider/model.
    #[error("No provider available for model: {0}")]
    NoProvider(String),

    /// Provider credentials are missing for an otherwise-known provider.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The model stream ended for a non-successful reason (error, content filter, etc.).
    #[error("Agent aborted: {0}")]
    AgentAborted(String),

    /// Too many tool-call rounds in a single agent invocation.
    #[error("Tool loop exceeded after {0} steps")]
    ToolLoopExceeded(u32),

    /// A non-retriable upstream API error (auth/billing/invalid request).
    #[error("Non-retriable API error ({status}): {message}")]
    NonRetriableApiError { status: u16, message: String },

    /// A retriable upstream API error (rate limit, overloaded, timeout, network).
    #[error("Retriable API error ({status}): {message}")]
    RetriableApiError { status: u16, message: String },

    /// A resolved filesystem path escaped the project sandbox root.
    #[error("Path escapes project root: {0}")]
    PathEscape(String),

    /// A configured version-save rate limit was hit.
    #[error("Version limit reached for this run")]
    VersionLimitReached,

    /// A cost or token budget was exceeded.
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// The dependency graph has no ready steps but some remain unterminated (a cycle).
    #[error("Plan malformed: {0}")]
    PlanMalformed(String),

    /// The operation was cancelled via an abort token.
    #[error("Cancelled")]
    Cancelled,

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL errors.
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Reqwest HTTP client errors.
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Generic errors that don't fit another variant.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the scheduler should retry the step that produced this error.
    ///
    /// Mirrors the classification in the retry-design section: provider
    /// unavailability, non-retriable API errors, cancellation and
    /// plan/config errors are fatal; rate limits, timeouts, network hiccups
    /// and stream aborts are worth another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::RetriableApiError { .. } | Error::AgentAborted(_) | Error::Reqwest(_)
        )
    }
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;
