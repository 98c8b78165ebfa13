//! Remediation Controller: bounded best-effort fix-and-re-review cycles
//! once the Review Detector reports failing output.
//!
//! The actual dispatch of a fixer agent and the re-review pass belong to
//! the Scheduler (which owns the database, tool sandbox, and provider
//! wiring) — this module only decides *which* agents to run, *what*
//! input to give them, and *how many* cycles to allow, then drives that
//! decision through injected async callbacks.

use std::future::Future;
use std::pin::Pin;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::review::{self, ReviewFindings, RoutingHints};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One fixer dispatch request: which dev agent, with what combined input.
#[derive(Debug, Clone)]
pub struct FixerRequest {
    pub agent_key: String,
    pub input: String,
}

/// Raw re-review output from the three reviewer agents, re-run with the
/// `re-review` upstream filter (architect output only).
#[derive(Debug, Clone, Default)]
pub struct ReReviewOutputs {
    pub code_review: String,
    pub security: String,
    pub qa: String,
}

/// Result of running the remediation loop to completion.
#[derive(Debug, Clone)]
pub struct RemediationOutcome {
    pub cycles_run: u32,
    pub resolved: bool,
    pub paused: bool,
    pub final_findings: ReviewFindings,
}

/// Which dev agents fix a failing review, derived from routing hints.
/// Falls back to `frontend-dev` alone when no reviewer tagged a bracket
/// hint — most UI regressions show up this way and frontend-dev is the
/// cheapest agent to re-run.
pub fn select_fixer_agents(hints: &RoutingHints) -> Vec<&'static str> {
    if !hints.any() {
        return vec!["frontend-dev"];
    }

    let mut agents = Vec::new();
    if hints.frontend {
        agents.push("frontend-dev");
    }
    if hints.backend {
        agents.push("backend-dev");
    }
    if hints.styling {
        agents.push("styling");
    }
    agents
}

/// Concatenate the failing reviewers' raw output into a single
/// remediation input with an instruction to output corrected files.
pub fn build_remediation_input(findings: &ReviewFindings) -> String {
    let mut sections = Vec::new();
    if let Some(output) = &findings.code_review_output {
        sections.push(format!("## Code Review Findings\n{output}"));
    }
    if let Some(output) = &findings.security_output {
        sections.push(format!("## Security Review Findings\n{output}"));
    }
    if let Some(output) = &findings.qa_output {
        sections.push(format!("## QA Review Findings\n{output}"));
    }

    format!(
        "The following review findings were raised against your last changes. \
         Fix every issue raised below and write the corrected files.\n\n{}",
        sections.join("\n\n")
    )
}

/// Drives bounded fix/re-review cycles against a set of initial findings.
pub struct RemediationController {
    max_cycles: u32,
}

impl RemediationController {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self { max_cycles: config.max_remediation_cycles }
    }

    /// Run cycles until findings are clean, the cycle cap is reached
    /// (best-effort exit, not a pipeline failure), or the budget check
    /// rejects the next cycle (paused).
    pub async fn run<'a, FixFn, ReviewFn, BudgetFn>(
        &self,
        initial_findings: ReviewFindings,
        mut dispatch_fixer: FixFn,
        mut re_review: ReviewFn,
        mut budget_allows: BudgetFn,
    ) -> Result<RemediationOutcome>
    where
        FixFn: FnMut(FixerRequest) -> BoxFuture<'a, Result<()>>,
        ReviewFn: FnMut() -> BoxFuture<'a, Result<ReReviewOutputs>>,
        BudgetFn: FnMut() -> BoxFuture<'a, Result<bool>>,
    {
        let mut findings = initial_findings;
        let mut cycles_run = 0u32;

        while findings.has_issues && cycles_run < self.max_cycles {
            if !budget_allows().await? {
                return Ok(RemediationOutcome {
                    cycles_run,
                    resolved: false,
                    paused: true,
                    final_findings: findings,
                });
            }

            let input = build_remediation_input(&findings);
            for agent_key in select_fixer_agents(&findings.routing_hints) {
                dispatch_fixer(FixerRequest { agent_key: agent_key.to_string(), input: input.clone() }).await?;
            }

            let re_reviewed = re_review().await?;
            findings = review::build_review_findings(&re_reviewed.code_review, &re_reviewed.security, &re_reviewed.qa);
            cycles_run += 1;
        }

        Ok(RemediationOutcome {
            cycles_run,
            resolved: !findings.has_issues,
            paused: false,
            final_findings: findings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing_findings(hints: RoutingHints) -> ReviewFindings {
        ReviewFindings {
            has_issues: true,
            code_review_output: Some(r#"{"status":"fail"} [frontend] misaligned button"#.to_string()),
            security_output: None,
            qa_output: None,
            routing_hints: hints,
        }
    }

    #[test]
    fn test_select_fixer_agents_defaults_to_frontend() {
        let agents = select_fixer_agents(&RoutingHints::default());
        assert_eq!(agents, vec!["frontend-dev"]);
    }

    #[test]
    fn test_select_fixer_agents_mixed_hints() {
        let hints = RoutingHints { frontend: true, backend: true, styling: false };
        let agents = select_fixer_agents(&hints);
        assert_eq!(agents, vec!["frontend-dev", "backend-dev"]);
    }

    #[test]
    fn test_build_remediation_input_includes_failing_sections_only() {
        let findings = ReviewFindings {
            has_issues: true,
            code_review_output: Some("bad code".to_string()),
            security_output: None,
            qa_output: Some("bad qa".to_string()),
            routing_hints: RoutingHints::default(),
        };
        let input = build_remediation_input(&findings);
        assert!(input.contains("bad code"));
        assert!(input.contains("bad qa"));
        assert!(!input.contains("Security Review Findings"));
    }

    #[tokio::test]
    async fn test_resolves_within_one_cycle() {
        let mut config = OrchestratorConfig::default();
        config.max_remediation_cycles = 2;
        let controller = RemediationController::new(&config);

        let outcome = controller
            .run(
                failing_findings(RoutingHints { frontend: true, ..Default::default() }),
                |_req| Box::pin(async { Ok(()) }),
                || {
                    Box::pin(async {
                        Ok(ReReviewOutputs {
                            code_review: "QA Review: Pass".to_string(),
                            security: "safe for production".to_string(),
                            qa: "passed with no issues".to_string(),
                        })
                    })
                },
                || Box::pin(async { Ok(true) }),
            )
            .await
            .unwrap();

        assert_eq!(outcome.cycles_run, 1);
        assert!(outcome.resolved);
        assert!(!outcome.paused);
    }

    #[tokio::test]
    async fn test_best_effort_exit_after_max_cycles() {
        let mut config = OrchestratorConfig::default();
        config.max_remediation_cycles = 2;
        let controller = RemediationController::new(&config);

        let outcome = controller
            .run(
                failing_findings(RoutingHints::default()),
                |_req| Box::pin(async { Ok(()) }),
                || {
                    Box::pin(async {
                        Ok(ReReviewOutputs {
                            code_review: "[FAIL] still broken".to_string(),
                            security: "safe for production".to_string(),
                            qa: "passed with no issues".to_string(),
                        })
                    })
                },
                || Box::pin(async { Ok(true) }),
            )
            .await
            .unwrap();

        assert_eq!(outcome.cycles_run, 2);
        assert!(!outcome.resolved);
        assert!(!outcome.paused);
    }

    #[tokio::test]
    async fn test_paused_when_budget_exceeded() {
        let mut config = OrchestratorConfig::default();
        config.max_remediation_cycles = 3;
        let controller = RemediationController::new(&config);

        let outcome = controller
            .run(
                failing_findings(RoutingHints::default()),
                |_req| Box::pin(async { Ok(()) }),
                || Box::pin(async { Ok(ReReviewOutputs::default()) }),
                || Box::pin(async { Ok(false) }),
            )
            .await
            .unwrap();

        assert_eq!(outcome.cycles_run, 0);
        assert!(outcome.paused);
        assert!(!outcome.resolved);
    }

    #[tokio::test]
    async fn test_dispatch_called_once_per_fixer_agent() {
        let mut config = OrchestratorConfig::default();
        config.max_remediation_cycles = 1;
        let controller = RemediationController::new(&config);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        controller
            .run(
                failing_findings(RoutingHints { frontend: true, backend: true, styling: false }),
                move |_req| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Ok(()) })
                },
                || Box::pin(async { Ok(ReReviewOutputs::default()) }),
                || Box::pin(async { Ok(true) }),
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
