//! Plan Builder: pure functions turning (user message, research JSON,
//! intent, scope) into a DAG of steps, with a separate pass to splice in
//! the parallel frontend-dev batch once the architect's file plan is
//! known.

use serde_json::Value;

use crate::registry;

/// Why the pipeline was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Build,
    Fix,
    Question,
}

impl Intent {
    pub fn as_label(&self) -> &'static str {
        match self {
            Intent::Build => "build",
            Intent::Fix => "fix",
            Intent::Question => "question",
        }
    }

    /// Parse a persisted label back into an `Intent`, defaulting to `Build`
    /// for any unrecognized value (matches the classifier's own fallback).
    pub fn from_label(label: &str) -> Self {
        match label {
            "fix" => Intent::Fix,
            "question" => Intent::Question,
            _ => Intent::Build,
        }
    }
}

/// Which part of the project this run is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Frontend,
    Backend,
    Styling,
    Full,
}

impl Scope {
    pub fn as_label(&self) -> &'static str {
        match self {
            Scope::Frontend => "frontend",
            Scope::Backend => "backend",
            Scope::Styling => "styling",
            Scope::Full => "full",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "frontend" => Scope::Frontend,
            "backend" => Scope::Backend,
            "styling" => Scope::Styling,
            _ => Scope::Full,
        }
    }
}

/// One planned step, keyed by a stable `node_key` (the same as
/// `instance_id ?? agent_key`) used for dependency wiring before any
/// database id exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub node_key: String,
    pub agent_key: String,
    pub instance_id: Option<String>,
    pub input: String,
    pub depends_on: Vec<String>,
}

impl StepSpec {
    fn new(node_key: &str, agent_key: &str, instance_id: Option<&str>, input: &str, depends_on: &[&str]) -> Self {
        Self {
            node_key: node_key.to_string(),
            agent_key: agent_key.to_string(),
            instance_id: instance_id.map(str::to_string),
            input: input.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A DAG of steps. Construction order mirrors the documented scenarios'
/// expected step ordering, but dependency wiring (not vector order) is
/// the scheduling contract — see `ready_set`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    pub steps: Vec<StepSpec>,
}

impl Plan {
    pub fn get(&self, node_key: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.node_key == node_key)
    }

    /// Steps not yet completed whose every dependency is in `completed`.
    /// `PlanMalformed` diagnostics (empty ready set with non-terminal
    /// steps remaining) are the Scheduler's concern, not the plan's.
    pub fn ready_set<'a>(&'a self, completed: &std::collections::HashSet<String>) -> Vec<&'a StepSpec> {
        self.steps
            .iter()
            .filter(|s| !completed.contains(&s.node_key))
            .filter(|s| s.depends_on.iter().all(|dep| completed.contains(dep)))
            .collect()
    }
}

const BACKEND_KEYWORDS: &[&str] = &[
    "express",
    "server-side",
    "database",
    "mongodb",
    "postgres",
    "api route",
    "node.js server",
    "backend server",
];

/// Does this research signal need a `backend-dev` step? Checked only
/// when `scope` includes the backend; a parseable `features[]` array is
/// authoritative, otherwise falls back to a keyword scan with a guard
/// against the common "no backend needed" negation.
pub fn needs_backend(research_signal: &str, scope: Scope) -> bool {
    if !matches!(scope, Scope::Full | Scope::Backend) {
        return false;
    }

    let trimmed = research_signal.trim();
    if trimmed.is_empty() {
        return false;
    }

    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        return json
            .get("features")
            .and_then(|v| v.as_array())
            .map(|features| {
                features
                    .iter()
                    .any(|f| f.get("requires_backend").and_then(|v| v.as_bool()).unwrap_or(false))
            })
            .unwrap_or(false);
    }

    let lower = trimmed.to_lowercase();
    if lower.contains("no backend needed") {
        return false;
    }

    BACKEND_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Build the initial DAG skeleton. For `Build`, the parallel frontend
/// split (if any) is spliced in afterward via `split_frontend_dev` once
/// the architect's file plan is known — this function always emits a
/// single `frontend-dev` node.
pub fn build_execution_plan(user_message: &str, research_signal: Option<&str>, intent: Intent, scope: Scope) -> Plan {
    match intent {
        Intent::Question => Plan {
            steps: vec![StepSpec::new(
                "orchestrator:question",
                "orchestrator:question",
                None,
                user_message,
                &[],
            )],
        },
        Intent::Build => build_plan(user_message, research_signal, scope),
        Intent::Fix => fix_plan(user_message, scope),
    }
}

fn reviewer_steps(user_message: &str, depends_on: &str) -> Vec<StepSpec> {
    vec![
        StepSpec::new("code-review", "code-review", None, user_message, &[depends_on]),
        StepSpec::new("security", "security", None, user_message, &[depends_on]),
        StepSpec::new("qa", "qa", None, user_message, &[depends_on]),
    ]
}

fn build_plan(user_message: &str, research_signal: Option<&str>, scope: Scope) -> Plan {
    let mut steps = vec![StepSpec::new("architect", "architect", None, user_message, &[])];

    steps.push(StepSpec::new("frontend-dev", "frontend-dev", None, user_message, &["architect"]));

    let include_backend = needs_backend(research_signal.unwrap_or(""), scope);
    let mut styling_deps = vec!["frontend-dev"];
    if include_backend {
        steps.push(StepSpec::new("backend-dev", "backend-dev", None, user_message, &["frontend-dev"]));
        styling_deps.push("backend-dev");
    }

    steps.push(StepSpec::new("styling", "styling", None, user_message, &styling_deps));
    steps.extend(reviewer_steps(user_message, "styling"));

    Plan { steps }
}

fn fix_plan(user_message: &str, scope: Scope) -> Plan {
    let mut steps = vec![StepSpec::new("testing", "testing", None, user_message, &[])];
    let mut tail = "testing".to_string();

    let include_frontend = matches!(scope, Scope::Frontend | Scope::Full);
    let include_backend = matches!(scope, Scope::Backend | Scope::Full);
    let include_styling = matches!(scope, Scope::Styling | Scope::Full);

    if include_frontend {
        steps.push(StepSpec::new("frontend-dev", "frontend-dev", None, user_message, &[tail.as_str()]));
        tail = "frontend-dev".to_string();
    }
    if include_backend {
        steps.push(StepSpec::new("backend-dev", "backend-dev", None, user_message, &[tail.as_str()]));
        tail = "backend-dev".to_string();
    }
    if include_styling {
        steps.push(StepSpec::new("styling", "styling", None, user_message, &[tail.as_str()]));
        tail = "styling".to_string();
    }

    steps.extend(reviewer_steps(user_message, &tail));
    Plan { steps }
}

/// Which bucket an architect file-plan entry lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Components,
    Shared,
    App,
}

/// One `{action, path}` entry from the architect's file plan.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub action: String,
    pub path: String,
}

/// The architect's file plan, bucketed for parallel frontend scheduling.
#[derive(Debug, Clone, Default)]
pub struct FilePlan {
    pub components: Vec<FileEntry>,
    pub shared: Vec<FileEntry>,
    pub app: Vec<FileEntry>,
}

fn bucket_for_path(path: &str) -> Bucket {
    let lower = path.to_lowercase();
    let first_segment = lower.split('/').next().unwrap_or("");

    match first_segment {
        "components" | "pages" => Bucket::Components,
        "hooks" | "utils" | "types" | "lib" | "helpers" | "constants" | "context" => Bucket::Shared,
        _ => {
            let file_name = lower.rsplit('/').next().unwrap_or(&lower);
            if file_name.starts_with("app.") {
                Bucket::App
            } else {
                Bucket::Shared
            }
        }
    }
}

/// Parse the architect's `file_plan` array (if present) into buckets.
pub fn parse_file_plan(architect_output: &Value) -> Option<FilePlan> {
    let entries = architect_output.get("file_plan")?.as_array()?;
    let mut plan = FilePlan::default();

    for entry in entries {
        let action = entry.get("action").and_then(|v| v.as_str()).unwrap_or("write").to_string();
        let Some(path) = entry.get("path").and_then(|v| v.as_str()) else { continue };
        let file_entry = FileEntry { action, path: path.to_string() };

        match bucket_for_path(path) {
            Bucket::Components => plan.components.push(file_entry),
            Bucket::Shared => plan.shared.push(file_entry),
            Bucket::App => plan.app.push(file_entry),
        }
    }

    Some(plan)
}

const MAX_COMPONENT_BATCHES: usize = 4;
const COMPONENTS_PER_BATCH: usize = 4;

/// Replace the plan's single `frontend-dev` node with the parallel
/// batch described by `file_plan`: an optional shared step, up to 4
/// component batches, and a final app-integration step depending on
/// every prior frontend-dev instance. Every step that previously
/// depended on `frontend-dev` is rewired to depend on the app step
/// instead.
pub fn split_frontend_dev(plan: &Plan, file_plan: &FilePlan, user_message: &str) -> Plan {
    let Some(original) = plan.get("frontend-dev") else { return plan.clone() };
    let original_deps = original.depends_on.clone();

    let mut frontend_nodes = Vec::new();

    if !file_plan.shared.is_empty() {
        frontend_nodes.push(StepSpec::new(
            "frontend-dev-shared",
            "frontend-dev",
            Some("shared"),
            user_message,
            &original_deps.iter().map(String::as_str).collect::<Vec<_>>(),
        ));
    }

    let batch_count = file_plan
        .components
        .len()
        .div_ceil(COMPONENTS_PER_BATCH)
        .min(MAX_COMPONENT_BATCHES)
        .max(if file_plan.components.is_empty() { 0 } else { 1 });

    for i in 0..batch_count {
        let node_key = format!("frontend-dev-{i}");
        frontend_nodes.push(StepSpec::new(
            &node_key,
            "frontend-dev",
            Some(&i.to_string()),
            user_message,
            &original_deps.iter().map(String::as_str).collect::<Vec<_>>(),
        ));
    }

    let prior_keys: Vec<String> = if frontend_nodes.is_empty() {
        original_deps.clone()
    } else {
        frontend_nodes.iter().map(|s| s.node_key.clone()).collect()
    };

    let app_step = StepSpec::new(
        "frontend-dev-app",
        "frontend-dev",
        Some("app"),
        user_message,
        &prior_keys.iter().map(String::as_str).collect::<Vec<_>>(),
    );
    let app_key = app_step.node_key.clone();
    frontend_nodes.push(app_step);

    let mut new_steps = Vec::with_capacity(plan.steps.len() + frontend_nodes.len());
    for step in &plan.steps {
        if step.node_key == "frontend-dev" {
            new_steps.extend(frontend_nodes.iter().cloned());
            continue;
        }

        let mut rewired = step.clone();
        for dep in rewired.depends_on.iter_mut() {
            if dep == "frontend-dev" {
                *dep = app_key.clone();
            }
        }
        new_steps.push(rewired);
    }

    Plan { steps: new_steps }
}

/// Resolve the per-agent output/tool-step caps for a step, falling back
/// to the registry default if the agent key is somehow unregistered
/// (shouldn't happen for a well-formed plan).
pub fn resolve_agent_for_step(step: &StepSpec) -> Option<registry::AgentConfig> {
    registry::get_agent(&step.agent_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_label_round_trip() {
        for intent in [Intent::Build, Intent::Fix, Intent::Question] {
            assert_eq!(Intent::from_label(intent.as_label()), intent);
        }
        assert_eq!(Intent::from_label("garbage"), Intent::Build);
    }

    #[test]
    fn test_scope_label_round_trip() {
        for scope in [Scope::Frontend, Scope::Backend, Scope::Styling, Scope::Full] {
            assert_eq!(Scope::from_label(scope.as_label()), scope);
        }
        assert_eq!(Scope::from_label("garbage"), Scope::Full);
    }

    #[test]
    fn test_needs_backend_empty_string() {
        assert!(!needs_backend("", Scope::Full));
    }

    #[test]
    fn test_needs_backend_json_no_features() {
        assert!(!needs_backend(r#"{"features": []}"#, Scope::Full));
    }

    #[test]
    fn test_needs_backend_negation_text() {
        assert!(!needs_backend("no backend needed", Scope::Full));
    }

    #[test]
    fn test_needs_backend_rest_endpoint_too_broad() {
        assert!(!needs_backend("needs a REST endpoint", Scope::Full));
    }

    #[test]
    fn test_needs_backend_express_keyword() {
        assert!(needs_backend("uses express server", Scope::Full));
    }

    #[test]
    fn test_needs_backend_json_features_flag() {
        let json = r#"{"features":[{"name":"api","requires_backend":true}]}"#;
        assert!(needs_backend(json, Scope::Full));
    }

    #[test]
    fn test_needs_backend_ignored_outside_full_or_backend_scope() {
        assert!(!needs_backend("uses express server", Scope::Styling));
    }

    #[test]
    fn test_scenario_1_happy_path_no_backend() {
        let plan = build_execution_plan("Build a landing page", None, Intent::Build, Scope::Full);
        let keys: Vec<&str> = plan.steps.iter().map(|s| s.node_key.as_str()).collect();
        assert_eq!(keys, vec!["architect", "frontend-dev", "styling", "code-review", "security", "qa"]);
    }

    #[test]
    fn test_scenario_2_build_with_backend() {
        let research = r#"{"features":[{"name":"api","requires_backend":true}]}"#;
        let plan = build_execution_plan("Build a dashboard", Some(research), Intent::Build, Scope::Full);

        let keys: Vec<&str> = plan.steps.iter().map(|s| s.node_key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["architect", "frontend-dev", "backend-dev", "styling", "code-review", "security", "qa"]
        );

        let styling = plan.get("styling").unwrap();
        assert_eq!(styling.depends_on, vec!["frontend-dev", "backend-dev"]);

        for reviewer in ["code-review", "security", "qa"] {
            assert_eq!(plan.get(reviewer).unwrap().depends_on, vec!["styling"]);
        }
    }

    #[test]
    fn test_question_plan_single_node() {
        let plan = build_execution_plan("What does this button do?", None, Intent::Question, Scope::Full);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].agent_key, "orchestrator:question");
    }

    #[test]
    fn test_fix_plan_frontend_scope_omits_backend_and_styling() {
        let plan = build_execution_plan("Button is broken", None, Intent::Fix, Scope::Frontend);
        assert!(plan.get("frontend-dev").is_some());
        assert!(plan.get("backend-dev").is_none());
        assert!(plan.get("styling").is_none());
        for reviewer in ["code-review", "security", "qa"] {
            assert_eq!(plan.get(reviewer).unwrap().depends_on, vec!["frontend-dev"]);
        }
    }

    #[test]
    fn test_fix_plan_styling_scope_omits_dev_agents() {
        let plan = build_execution_plan("Colors look off", None, Intent::Fix, Scope::Styling);
        assert!(plan.get("frontend-dev").is_none());
        assert!(plan.get("backend-dev").is_none());
        assert!(plan.get("styling").is_some());
        assert_eq!(plan.get("styling").unwrap().depends_on, vec!["testing"]);
    }

    #[test]
    fn test_plan_determinism_round_trip() {
        let a = build_execution_plan("Build a landing page", None, Intent::Build, Scope::Full);
        let b = build_execution_plan("Build a landing page", None, Intent::Build, Scope::Full);
        assert_eq!(a, b);
    }

    #[test]
    fn test_ready_set_respects_dependencies() {
        let plan = build_execution_plan("Build a landing page", None, Intent::Build, Scope::Full);
        let completed = std::collections::HashSet::new();
        let ready = plan.ready_set(&completed);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].node_key, "architect");
    }

    #[test]
    fn test_split_frontend_dev_component_batches() {
        let plan = build_execution_plan("Build a dashboard", None, Intent::Build, Scope::Full);
        let mut file_plan = FilePlan::default();
        for i in 0..10 {
            file_plan.components.push(FileEntry { action: "write".to_string(), path: format!("components/Widget{i}.tsx") });
        }
        file_plan.shared.push(FileEntry { action: "write".to_string(), path: "hooks/useData.ts".to_string() });

        let split = split_frontend_dev(&plan, &file_plan, "Build a dashboard");

        assert!(split.get("frontend-dev-shared").is_some());
        assert!(split.get("frontend-dev-0").is_some());
        assert!(split.get("frontend-dev-app").is_some());
        assert!(split.get("frontend-dev").is_none());

        let app = split.get("frontend-dev-app").unwrap();
        assert!(app.depends_on.contains(&"frontend-dev-shared".to_string()));
        assert!(app.depends_on.contains(&"frontend-dev-0".to_string()));

        let styling = split.get("styling").unwrap();
        assert_eq!(styling.depends_on, vec!["frontend-dev-app"]);
    }

    #[test]
    fn test_parse_file_plan_buckets_by_prefix() {
        let json = serde_json::json!({
            "file_plan": [
                {"action": "create", "path": "components/Header.tsx"},
                {"action": "create", "path": "hooks/useAuth.ts"},
                {"action": "create", "path": "App.tsx"},
            ]
        });
        let plan = parse_file_plan(&json).unwrap();
        assert_eq!(plan.components.len(), 1);
        assert_eq!(plan.shared.len(), 1);
        assert_eq!(plan.app.len(), 1);
    }
}
