//! Scheduler: drives a Plan Builder DAG to completion.
//!
//! Ready steps (every dependency already completed) are dispatched in
//! parallel batches bounded by `config.fanout_limit`; the ready set is
//! recomputed after each batch. A fatal step failure halts the run
//! immediately (dependents never dispatch); a retriable failure is
//! retried up to `config.max_retries` times in place. Once every step in
//! the plan is terminal, the Review Detector and (if needed) the
//! Remediation Controller run, followed by a final summary step.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentInput, AgentRunner, ChatMessage};
use crate::bus::{self, Event};
use crate::config::OrchestratorConfig;
use crate::cost::CostLedger;
use crate::error::{Error, Result};
use crate::plan::{self, Intent, Scope, StepSpec};
use crate::provider::binding::ProviderCredentials;
use crate::provider::stream::StepUsage;
use crate::registry;
use crate::remediation::{FixerRequest, ReReviewOutputs, RemediationController, RemediationOutcome};
use crate::review::{self, ReviewFindings};
use crate::store::{NewStep, Store};
use crate::tools::ToolSandbox;

/// Everything one pipeline run needs besides process-wide services.
#[derive(Clone)]
pub struct PipelineRequest {
    pub chat_id: String,
    pub project_id: String,
    pub project_path: PathBuf,
    pub user_message: String,
    pub chat_history: Vec<ChatMessage>,
    pub intent: Intent,
    pub scope: Scope,
    pub research_signal: Option<String>,
    pub api_keys: HashMap<String, ProviderCredentials>,
    pub cancel: CancellationToken,
}

/// Final disposition of a run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub pipeline_run_id: Uuid,
    pub halted: bool,
    pub halted_reason: Option<String>,
    pub remediation: Option<RemediationOutcome>,
    pub summary: Option<String>,
}

/// Process-wide `chatId -> cancelToken` registry backing `abortOrchestration`.
/// Single-writer per chat: `run`/`resume` register their token for the
/// duration of the call and remove it once the run terminates; `abort`
/// only ever reads and signals.
mod cancel_registry {
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    use tokio_util::sync::CancellationToken;

    static REGISTRY: OnceLock<Mutex<HashMap<String, CancellationToken>>> = OnceLock::new();

    fn registry() -> &'static Mutex<HashMap<String, CancellationToken>> {
        REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub fn register(chat_id: &str, token: CancellationToken) {
        registry().lock().expect("cancel registry poisoned").insert(chat_id.to_string(), token);
    }

    pub fn get(chat_id: &str) -> Option<CancellationToken> {
        registry().lock().expect("cancel registry poisoned").get(chat_id).cloned()
    }

    pub fn remove(chat_id: &str) {
        registry().lock().expect("cancel registry poisoned").remove(chat_id);
    }
}

/// Head+tail elision so a downstream prompt never inherits an unbounded
/// upstream output.
fn truncate_upstream(text: &str, cap: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= cap || cap == 0 {
        return text.to_string();
    }
    let head_len = cap * 2 / 3;
    let tail_len = cap.saturating_sub(head_len);
    let head: String = text.chars().take(head_len).collect();
    let tail: String = text.chars().rev().take(tail_len).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{head}\n...[truncated]...\n{tail}")
}

/// Whether the project checkout already has any files in it (ignoring
/// VCS metadata), used to force `build`/`full` on a brand-new project.
fn project_has_existing_files(path: &std::path::Path) -> bool {
    let Ok(entries) = std::fs::read_dir(path) else {
        return false;
    };
    entries
        .filter_map(|e| e.ok())
        .any(|e| e.file_name() != ".git")
}

/// The three reviewer agents get architect output plus a file manifest
/// instead of a raw dev-agent passthrough; every other step just gets
/// its declared dependency outputs.
fn is_reviewer_agent(agent_key: &str) -> bool {
    matches!(agent_key, "code-review" | "security" | "qa")
}

/// Flatten a `ToolSandbox::list_files` tree into a newline-separated list
/// of file paths (directories are walked into, not listed themselves).
fn render_file_manifest(value: &Value) -> String {
    fn walk(node: &Value, out: &mut String) {
        let Some(entries) = node.as_array() else { return };
        for entry in entries {
            let node_type = entry.get("type").and_then(|t| t.as_str()).unwrap_or_default();
            if node_type == "file" {
                if let Some(path) = entry.get("path").and_then(|p| p.as_str()) {
                    out.push_str(path);
                    out.push('\n');
                }
            }
            if let Some(children) = entry.get("children") {
                walk(children, out);
            }
        }
    }

    let mut out = String::new();
    walk(value, &mut out);
    out
}

/// Parse the classifier agent's `{"intent": "...", "scope": "..."}`
/// response, falling back to `build`/`full` if it isn't well-formed.
fn parse_classification(content: &str) -> (Intent, Scope) {
    let Some(start) = content.find('{') else {
        return (Intent::Build, Scope::Full);
    };
    let Some(end) = content.rfind('}') else {
        return (Intent::Build, Scope::Full);
    };
    if end < start {
        return (Intent::Build, Scope::Full);
    }

    match serde_json::from_str::<Value>(&content[start..=end]) {
        Ok(json) => {
            let intent = json.get("intent").and_then(|v| v.as_str()).map(Intent::from_label).unwrap_or(Intent::Build);
            let scope = json.get("scope").and_then(|v| v.as_str()).map(Scope::from_label).unwrap_or(Scope::Full);
            (intent, scope)
        }
        Err(_) => (Intent::Build, Scope::Full),
    }
}

#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    cost: CostLedger,
    runner: AgentRunner,
    config: OrchestratorConfig,
}

impl Scheduler {
    pub fn new(store: Store, cost: CostLedger, runner: AgentRunner, config: OrchestratorConfig) -> Self {
        Self { store, cost, runner, config }
    }

    /// Crash-recovery entry point: mark every stale `running`/`retrying`
    /// row `failed` and notify affected chats. Call once at process
    /// startup before accepting new pipeline runs.
    pub async fn recover_stale_executions(&self) -> Result<u64> {
        self.store.cleanup_stale_executions().await
    }

    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineOutcome> {
        let daily = self.cost.check_daily_limit().await?;
        let project = self.cost.check_project_limit(&request.project_id).await?;
        if !daily.allowed || !project.allowed {
            bus::publish(Event::PipelineHalted {
                chat_id: request.chat_id.clone(),
                failed_agent: "scheduler".to_string(),
                reason: "budget exceeded before dispatch".to_string(),
            });
            return Err(Error::BudgetExceeded("daily or project limit already exceeded".to_string()));
        }

        if let Some(m) = crate::observability::metrics() {
            m.record_pipeline_started();
        }

        let current_plan = plan::build_execution_plan(
            &request.user_message,
            request.research_signal.as_deref(),
            request.intent,
            request.scope,
        );

        let pipeline_run_id = self
            .store
            .record_pipeline_start(
                &request.chat_id,
                &request.project_id,
                request.project_path.to_string_lossy().as_ref(),
                &request.user_message,
                request.intent.as_label(),
                request.scope.as_label(),
            )
            .await?;

        cancel_registry::register(&request.chat_id, request.cancel.clone());
        let outcome = self
            .execute_plan(&request, pipeline_run_id, current_plan, HashSet::new(), BTreeMap::new(), false)
            .await;
        cancel_registry::remove(&request.chat_id);
        outcome
    }

    /// Continue a pipeline run from its first non-completed step, after a
    /// crash or a previous `abortOrchestration` call. Completed steps (and
    /// the frontend-dev split, if it had already been applied) are
    /// reconstructed from the persisted step rows and never re-executed.
    pub async fn resume(
        &self,
        pipeline_run_id: Uuid,
        chat_id: String,
        api_keys: HashMap<String, ProviderCredentials>,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome> {
        let run_record = self.store.get_pipeline_run(pipeline_run_id).await?;
        let intent = Intent::from_label(&run_record.intent);
        let scope = Scope::from_label(&run_record.scope);

        let mut current_plan =
            plan::build_execution_plan(&run_record.user_message, None, intent, scope);

        let steps = self.store.list_steps(pipeline_run_id).await?;
        let mut completed: HashSet<String> = HashSet::new();
        let mut outputs: BTreeMap<String, String> = BTreeMap::new();
        for step in &steps {
            if step.status == crate::store::StepStatus::Completed {
                let node_key = step.instance_id.clone().unwrap_or_else(|| step.agent_key.clone());
                if let Some(output) = &step.output {
                    outputs.insert(node_key.clone(), output.clone());
                }
                completed.insert(node_key);
            }
        }

        let mut frontend_split_applied = false;
        if completed.contains("architect") {
            frontend_split_applied = true;
            if let Some(architect_output) = outputs.get("architect") {
                if let Ok(architect_json) = serde_json::from_str::<Value>(architect_output) {
                    if let Some(file_plan) = plan::parse_file_plan(&architect_json) {
                        current_plan = plan::split_frontend_dev(&current_plan, &file_plan, &run_record.user_message);
                    }
                }
            }
        }

        let request = PipelineRequest {
            chat_id,
            project_id: run_record.project_id,
            project_path: PathBuf::from(run_record.project_path),
            user_message: run_record.user_message,
            chat_history: Vec::new(),
            intent,
            scope,
            research_signal: None,
            api_keys,
            cancel,
        };

        cancel_registry::register(&request.chat_id, request.cancel.clone());
        let outcome = self
            .execute_plan(&request, pipeline_run_id, current_plan, completed, outputs, frontend_split_applied)
            .await;
        cancel_registry::remove(&request.chat_id);
        outcome
    }

    /// Signal the cancel token registered for `chat_id`'s in-flight run, if
    /// any. Returns `false` when no run is currently registered for this
    /// chat. Cancellation is cooperative: `isOrchestrationRunning` should
    /// be polled afterwards rather than assuming the run has stopped.
    pub fn abort(&self, chat_id: &str) -> bool {
        match cancel_registry::get(chat_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether `chat_id` has a pipeline run with any non-terminal step.
    pub async fn is_running(&self, chat_id: &str) -> Result<bool> {
        self.store.has_active_pipeline(chat_id).await
    }

    /// Decide intent/scope for a fresh run when the caller didn't force
    /// them. An empty project checkout always forces `build`/`full`;
    /// otherwise the cheap `orchestrator:classify` agent is asked, falling
    /// back to `build`/`full` on any missing provider, invocation error, or
    /// unparsable response.
    pub async fn classify(
        &self,
        chat_id: &str,
        project_path: &std::path::Path,
        user_message: &str,
        api_keys: &HashMap<String, ProviderCredentials>,
    ) -> (Intent, Scope) {
        if !project_has_existing_files(project_path) {
            return (Intent::Build, Scope::Full);
        }

        let Some(agent) = registry::get_agent("orchestrator:classify") else {
            return (Intent::Build, Scope::Full);
        };
        let Some(credentials) = api_keys.get(&agent.provider).cloned() else {
            return (Intent::Build, Scope::Full);
        };
        let Ok(handle) = crate::provider::binding::provider(&agent.provider, &agent.model) else {
            return (Intent::Build, Scope::Full);
        };

        let sandbox = Arc::new(ToolSandbox::new(project_path.to_path_buf(), self.config.max_agent_versions_per_run));
        let input = AgentInput {
            user_message: user_message.to_string(),
            chat_history: Vec::new(),
            context: Value::Null,
            upstream_outputs: BTreeMap::new(),
        };

        // No project_id exists yet at classification time (it runs ahead of
        // `run`/`resume`, before a pipeline record exists) and this agent
        // never writes files, so it never publishes `FilesChanged` either.
        let outcome = self
            .runner
            .invoke(&agent, chat_id, "", None, input, handle, credentials, sandbox, CancellationToken::new())
            .await;

        match outcome {
            Ok(outcome) => parse_classification(&outcome.content),
            Err(_) => (Intent::Build, Scope::Full),
        }
    }

    async fn execute_plan(
        &self,
        request: &PipelineRequest,
        pipeline_run_id: Uuid,
        mut current_plan: plan::Plan,
        mut completed: HashSet<String>,
        mut outputs: BTreeMap<String, String>,
        mut frontend_split_applied: bool,
    ) -> Result<PipelineOutcome> {
        let sandbox = Arc::new(ToolSandbox::new(request.project_path.clone(), self.config.max_agent_versions_per_run));

        loop {
            if request.cancel.is_cancelled() {
                self.store.mark_pipeline_aborted(pipeline_run_id).await?;
                if let Some(m) = crate::observability::metrics() {
                    m.record_pipeline_finished(true);
                }
                return Ok(PipelineOutcome {
                    pipeline_run_id,
                    halted: true,
                    halted_reason: Some("cancelled".to_string()),
                    remediation: None,
                    summary: None,
                });
            }

            if !frontend_split_applied && completed.contains("architect") {
                frontend_split_applied = true;
                if let Some(architect_output) = outputs.get("architect") {
                    if let Ok(architect_json) = serde_json::from_str::<Value>(architect_output) {
                        if let Some(file_plan) = plan::parse_file_plan(&architect_json) {
                            current_plan = plan::split_frontend_dev(&current_plan, &file_plan, &request.user_message);
                        }
                    }
                }
            }

            let ready: Vec<StepSpec> = current_plan.ready_set(&completed).into_iter().cloned().collect();

            if ready.is_empty() {
                if completed.len() == current_plan.steps.len() {
                    break;
                }
                let reason = "ready set empty with non-terminal steps remaining".to_string();
                self.store.mark_pipeline_aborted(pipeline_run_id).await?;
                bus::publish(Event::PipelineHalted {
                    chat_id: request.chat_id.clone(),
                    failed_agent: "scheduler".to_string(),
                    reason: reason.clone(),
                });
                if let Some(m) = crate::observability::metrics() {
                    m.record_pipeline_finished(true);
                }
                return Err(Error::PlanMalformed(reason));
            }

            let budget_check = self.cost.check_cost_limit(&request.chat_id).await?;
            if !budget_check.allowed {
                self.store.mark_pipeline_aborted(pipeline_run_id).await?;
                bus::publish(Event::PipelineHalted {
                    chat_id: request.chat_id.clone(),
                    failed_agent: "scheduler".to_string(),
                    reason: "chat token budget exceeded".to_string(),
                });
                if let Some(m) = crate::observability::metrics() {
                    m.record_pipeline_finished(true);
                }
                return Ok(PipelineOutcome {
                    pipeline_run_id,
                    halted: true,
                    halted_reason: Some("chat token budget exceeded".to_string()),
                    remediation: None,
                    summary: None,
                });
            }

            let semaphore = Arc::new(Semaphore::new(self.config.fanout_limit.max(1)));
            let mut handles = Vec::new();

            for step in ready {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let upstream = if is_reviewer_agent(&step.agent_key) {
                    self.build_reviewer_upstream(&outputs, &sandbox).await
                } else {
                    self.build_upstream_outputs(&step, &outputs)
                };
                let scheduler = self.clone();
                let sandbox = sandbox.clone();
                let cancel = request.cancel.clone();
                let chat_id = request.chat_id.clone();
                let project_id = request.project_id.clone();
                let api_keys = request.api_keys.clone();
                let chat_history = request.chat_history.clone();
                let step_for_dispatch = step.clone();

                handles.push(async move {
                    let result = scheduler
                        .dispatch_step(pipeline_run_id, chat_id, project_id, step_for_dispatch, upstream, chat_history, api_keys, sandbox, cancel)
                        .await;
                    drop(permit);
                    (step, result)
                });
            }

            let results = futures::future::join_all(handles).await;

            for (step, result) in results {
                match result {
                    Ok((_, content)) => {
                        outputs.insert(step.node_key.clone(), content);
                        completed.insert(step.node_key.clone());
                    }
                    Err(err) => {
                        self.store.mark_pipeline_aborted(pipeline_run_id).await?;
                        bus::publish(Event::PipelineHalted {
                            chat_id: request.chat_id.clone(),
                            failed_agent: step.agent_key.clone(),
                            reason: err.to_string(),
                        });
                        if let Some(m) = crate::observability::metrics() {
                            m.record_pipeline_finished(true);
                        }
                        return Ok(PipelineOutcome {
                            pipeline_run_id,
                            halted: true,
                            halted_reason: Some(err.to_string()),
                            remediation: None,
                            summary: None,
                        });
                    }
                }
            }
        }

        let remediation = if let (Some(cr), Some(sec), Some(qa)) =
            (outputs.get("code-review"), outputs.get("security"), outputs.get("qa"))
        {
            let findings = review::build_review_findings(cr, sec, qa);
            if findings.has_issues {
                Some(self.run_remediation(request, pipeline_run_id, findings, &outputs, sandbox.clone()).await?)
            } else {
                None
            }
        } else {
            None
        };

        let summary = self.dispatch_summary(request, pipeline_run_id, &outputs, sandbox).await.ok();

        if let Some(m) = crate::observability::metrics() {
            m.record_pipeline_finished(false);
        }

        Ok(PipelineOutcome {
            pipeline_run_id,
            halted: false,
            halted_reason: None,
            remediation,
            summary,
        })
    }

    /// Upstream outputs visible to `step`, filtered to its declared
    /// dependencies and truncated per `upstream_truncation_chars`.
    fn build_upstream_outputs(&self, step: &StepSpec, outputs: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        for dep in &step.depends_on {
            if let Some(output) = outputs.get(dep) {
                result.insert(dep.clone(), truncate_upstream(output, self.config.upstream_truncation_chars));
            }
        }
        result
    }

    /// Upstream context for reviewer steps (`code-review`/`security`/
    /// `qa`): the architect's plan plus a file manifest of the project
    /// root (paths only, no content), never the raw dev-agent output a
    /// generic dependency passthrough would hand them — a reviewer reads
    /// the actual files itself via `read_file`/`list_files` tool calls
    /// once it knows what exists.
    async fn build_reviewer_upstream(&self, outputs: &BTreeMap<String, String>, sandbox: &Arc<ToolSandbox>) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        if let Some(architect) = outputs.get("architect") {
            result.insert("architect".to_string(), truncate_upstream(architect, self.config.upstream_truncation_chars));
        }
        let manifest = match sandbox.list_files(None).await {
            Ok(value) => render_file_manifest(&value),
            Err(_) => String::new(),
        };
        result.insert("project-source".to_string(), truncate_upstream(&manifest, self.config.upstream_truncation_chars));
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_step(
        &self,
        pipeline_run_id: Uuid,
        chat_id: String,
        project_id: String,
        step: StepSpec,
        upstream_outputs: BTreeMap<String, String>,
        chat_history: Vec<ChatMessage>,
        api_keys: HashMap<String, ProviderCredentials>,
        sandbox: Arc<ToolSandbox>,
        cancel: CancellationToken,
    ) -> Result<(Uuid, String)> {
        let step_id = self
            .store
            .record_step_start(&NewStep {
                pipeline_run_id,
                agent_key: step.agent_key.clone(),
                instance_id: step.instance_id.clone(),
                input: step.input.clone(),
                depends_on: Vec::new(),
            })
            .await?;

        let agent = registry::get_agent(&step.agent_key)
            .ok_or_else(|| Error::NotFound(format!("agent config: {}", step.agent_key)))?;

        let timer = crate::observability::StepTimer::start(&agent.agent_key);
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                self.store.record_step_stopped(step_id).await?;
                timer.finish("stopped");
                return Err(Error::Cancelled);
            }

            let handle = crate::provider::binding::provider(&agent.provider, &agent.model)?;
            let credentials = api_keys
                .get(&agent.provider)
                .cloned()
                .ok_or_else(|| Error::ProviderUnavailable(agent.provider.clone()))?;

            let record_id = self
                .cost
                .track_provisional_usage(
                    step_id,
                    &chat_id,
                    &project_id,
                    &agent.agent_key,
                    &agent.provider,
                    &agent.model,
                    &credentials.api_key,
                    &step.input,
                )
                .await?;

            let input = AgentInput {
                user_message: step.input.clone(),
                chat_history: chat_history.clone(),
                context: Value::Null,
                upstream_outputs: upstream_outputs.clone(),
            };

            let invoke_result = self
                .runner
                .invoke(&agent, &chat_id, &project_id, step.instance_id.as_deref(), input, handle, credentials, sandbox.clone(), cancel.clone())
                .await;

            match invoke_result {
                Ok(outcome) => {
                    let usage = StepUsage {
                        input_tokens: outcome.usage.input_tokens,
                        output_tokens: outcome.usage.output_tokens,
                        cache_creation_input_tokens: outcome.usage.cache_creation_input_tokens,
                        cache_read_input_tokens: outcome.usage.cache_read_input_tokens,
                    };
                    let cost = self.cost.finalize_token_usage(record_id, &agent.provider, &agent.model, usage).await?;
                    if let Some(m) = crate::observability::metrics() {
                        let total_tokens = usage.input_tokens + usage.output_tokens;
                        m.record_tokens(&agent.provider, &agent.model, total_tokens, cost);
                    }
                    self.store.record_step_complete(step_id, &outcome.content).await?;
                    timer.finish("completed");
                    return Ok((step_id, outcome.content));
                }
                Err(err) => {
                    self.cost.void_provisional_usage(record_id).await?;

                    if err.is_retriable() && attempt < self.config.max_retries {
                        attempt += 1;
                        self.store.record_step_retry(step_id, attempt).await?;
                        self.store.record_step_running(step_id).await?;
                        continue;
                    }

                    self.store.record_step_failed(step_id, &err.to_string()).await?;
                    timer.finish("failed");
                    return Err(err);
                }
            }
        }
    }

    async fn run_remediation(
        &self,
        request: &PipelineRequest,
        pipeline_run_id: Uuid,
        findings: ReviewFindings,
        prior_outputs: &BTreeMap<String, String>,
        sandbox: Arc<ToolSandbox>,
    ) -> Result<RemediationOutcome> {
        let controller = RemediationController::new(&self.config);
        let architect_output = prior_outputs.get("architect").cloned().unwrap_or_default();

        let scheduler = self.clone();
        let chat_id = request.chat_id.clone();
        let project_id = request.project_id.clone();
        let api_keys = request.api_keys.clone();
        let chat_history = request.chat_history.clone();
        let cancel = request.cancel.clone();

        let fixer_scheduler = scheduler.clone();
        let fixer_chat_id = chat_id.clone();
        let fixer_project_id = project_id.clone();
        let fixer_api_keys = api_keys.clone();
        let fixer_chat_history = chat_history.clone();
        let fixer_cancel = cancel.clone();
        let fixer_sandbox = sandbox.clone();
        let fixer_architect_output = architect_output.clone();

        let review_scheduler = scheduler.clone();
        let review_chat_id = chat_id.clone();
        let review_project_id = project_id.clone();
        let review_api_keys = api_keys.clone();
        let review_chat_history = chat_history.clone();
        let review_cancel = cancel.clone();
        let review_sandbox = sandbox.clone();
        let review_architect_output = architect_output.clone();

        let budget_scheduler = scheduler.clone();
        let budget_chat_id = chat_id.clone();
        let budget_project_id = project_id.clone();

        controller
            .run(
                findings,
                move |req: FixerRequest| {
                    let scheduler = fixer_scheduler.clone();
                    let chat_id = fixer_chat_id.clone();
                    let project_id = fixer_project_id.clone();
                    let api_keys = fixer_api_keys.clone();
                    let chat_history = fixer_chat_history.clone();
                    let cancel = fixer_cancel.clone();
                    let sandbox = fixer_sandbox.clone();
                    let mut upstream = BTreeMap::new();
                    upstream.insert("architect".to_string(), fixer_architect_output.clone());

                    Box::pin(async move {
                        let step = StepSpec {
                            node_key: format!("remediation-{}", req.agent_key),
                            agent_key: req.agent_key,
                            instance_id: Some("remediation".to_string()),
                            input: req.input,
                            depends_on: vec![],
                        };
                        scheduler
                            .dispatch_step(pipeline_run_id, chat_id, project_id, step, upstream, chat_history, api_keys, sandbox, cancel)
                            .await
                            .map(|_| ())
                    })
                },
                move || {
                    let scheduler = review_scheduler.clone();
                    let chat_id = review_chat_id.clone();
                    let project_id = review_project_id.clone();
                    let api_keys = review_api_keys.clone();
                    let chat_history = review_chat_history.clone();
                    let cancel = review_cancel.clone();
                    let sandbox = review_sandbox.clone();
                    let architect_output = review_architect_output.clone();

                    Box::pin(async move {
                        let mut upstream = BTreeMap::new();
                        upstream.insert("architect".to_string(), architect_output);

                        let mut reviewed = ReReviewOutputs::default();
                        for key in ["code-review", "security", "qa"] {
                            let step = StepSpec {
                                node_key: format!("re-review-{key}"),
                                agent_key: key.to_string(),
                                instance_id: Some("re-review".to_string()),
                                input: "Re-review the corrected files against the original findings.".to_string(),
                                depends_on: vec![],
                            };
                            let (_, content) = scheduler
                                .dispatch_step(
                                    pipeline_run_id,
                                    chat_id.clone(),
                                    project_id.clone(),
                                    step,
                                    upstream.clone(),
                                    chat_history.clone(),
                                    api_keys.clone(),
                                    sandbox.clone(),
                                    cancel.clone(),
                                )
                                .await?;
                            match key {
                                "code-review" => reviewed.code_review = content,
                                "security" => reviewed.security = content,
                                "qa" => reviewed.qa = content,
                                _ => unreachable!(),
                            }
                        }
                        if let Some(m) = crate::observability::metrics() {
                            m.record_remediation_cycle();
                        }
                        Ok(reviewed)
                    })
                },
                move || {
                    let scheduler = budget_scheduler.clone();
                    let chat_id = budget_chat_id.clone();
                    let project_id = budget_project_id.clone();
                    Box::pin(async move {
                        let daily = scheduler.cost.check_daily_limit().await?;
                        let project = scheduler.cost.check_project_limit(&project_id).await?;
                        let chat = scheduler.cost.check_cost_limit(&chat_id).await?;
                        Ok(daily.allowed && project.allowed && chat.allowed)
                    })
                },
            )
            .await
    }

    async fn dispatch_summary(
        &self,
        request: &PipelineRequest,
        pipeline_run_id: Uuid,
        outputs: &BTreeMap<String, String>,
        sandbox: Arc<ToolSandbox>,
    ) -> Result<String> {
        let step = StepSpec {
            node_key: "orchestrator:summary".to_string(),
            agent_key: "orchestrator:summary".to_string(),
            instance_id: None,
            input: request.user_message.clone(),
            depends_on: outputs.keys().cloned().collect(),
        };
        let upstream = self.build_upstream_outputs(&step, outputs);

        let (_, content) = self
            .dispatch_step(
                pipeline_run_id,
                request.chat_id.clone(),
                request.project_id.clone(),
                step,
                upstream,
                request.chat_history.clone(),
                request.api_keys.clone(),
                sandbox,
                request.cancel.clone(),
            )
            .await?;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_upstream_short_text_unchanged() {
        assert_eq!(truncate_upstream("hello", 100), "hello");
    }

    #[test]
    fn test_truncate_upstream_long_text_elides_middle() {
        let text = "a".repeat(200);
        let truncated = truncate_upstream(&text, 50);
        assert!(truncated.contains("...[truncated]..."));
        assert!(truncated.len() < text.len());
    }

    #[test]
    fn test_parse_classification_well_formed() {
        let (intent, scope) = parse_classification(r#"{"intent": "fix", "scope": "backend"}"#);
        assert_eq!(intent, Intent::Fix);
        assert_eq!(scope, Scope::Backend);
    }

    #[test]
    fn test_parse_classification_embedded_in_prose() {
        let (intent, scope) = parse_classification("Here you go:\n```json\n{\"intent\": \"question\", \"scope\": \"full\"}\n```");
        assert_eq!(intent, Intent::Question);
        assert_eq!(scope, Scope::Full);
    }

    #[test]
    fn test_parse_classification_malformed_falls_back() {
        let (intent, scope) = parse_classification("not json at all");
        assert_eq!(intent, Intent::Build);
        assert_eq!(scope, Scope::Full);
    }

    #[test]
    fn test_is_reviewer_agent() {
        assert!(is_reviewer_agent("code-review"));
        assert!(is_reviewer_agent("security"));
        assert!(is_reviewer_agent("qa"));
        assert!(!is_reviewer_agent("frontend-dev"));
        assert!(!is_reviewer_agent("architect"));
    }

    #[test]
    fn test_render_file_manifest_flattens_nested_tree() {
        let tree = serde_json::json!([
            {"name": "src", "path": "src", "type": "directory", "children": [
                {"name": "App.tsx", "path": "src/App.tsx", "type": "file"}
            ]},
            {"name": "package.json", "path": "package.json", "type": "file"}
        ]);
        let manifest = render_file_manifest(&tree);
        assert!(manifest.contains("src/App.tsx"));
        assert!(manifest.contains("package.json"));
        assert!(!manifest.contains("\"type\""));
    }

    #[test]
    fn test_is_retriable_classification() {
        assert!(Error::RetriableApiError { status: 429, message: "rate limited".to_string() }.is_retriable());
        assert!(!Error::NonRetriableApiError { status: 400, message: "bad request".to_string() }.is_retriable());
        assert!(!Error::ProviderUnavailable("anthropic".to_string()).is_retriable());
        assert!(!Error::Cancelled.is_retriable());
    }
}
