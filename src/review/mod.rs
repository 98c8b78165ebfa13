//! Review Detector: classifies the three reviewer agents' free-text
//! output as clean or failing, and extracts routing hints for
//! Remediation.

use serde_json::Value;

/// Pass/fail verdict for one reviewer's raw output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Failing,
}

const FAILING_MARKERS: &[&str] = &[
    r#""status":"fail""#,
    "[fail]",
    "critical issue",
    "must fix",
    "severity: critical",
    "severity: high",
];

const PASS_PHRASES: &[&str] = &[
    "qa review: pass",
    "passed with no issues",
    "zero security vulnerabilities",
    "safe for production",
];

/// Classify one reviewer's raw output. Failing markers take priority
/// over pass phrases; anything matching neither (including empty or
/// whitespace-only output) is treated as clean.
pub fn classify(output: &str) -> Verdict {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Verdict::Clean;
    }

    let lower = trimmed.to_lowercase();

    if FAILING_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Verdict::Failing;
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
        if parsed.get("status").and_then(|v| v.as_str()) == Some("pass") {
            return Verdict::Clean;
        }
    }

    if PASS_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return Verdict::Clean;
    }

    Verdict::Clean
}

/// Bracketed routing tags extracted from a failing reviewer's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingHints {
    pub frontend: bool,
    pub backend: bool,
    pub styling: bool,
}

impl RoutingHints {
    pub fn any(&self) -> bool {
        self.frontend || self.backend || self.styling
    }

    fn merge(&mut self, other: RoutingHints) {
        self.frontend |= other.frontend;
        self.backend |= other.backend;
        self.styling |= other.styling;
    }
}

fn extract_routing_hints(output: &str) -> RoutingHints {
    let lower = output.to_lowercase();
    RoutingHints {
        frontend: lower.contains("[frontend]"),
        backend: lower.contains("[backend]"),
        styling: lower.contains("[styling]"),
    }
}

/// Combined verdict across the three reviewer agents.
#[derive(Debug, Clone)]
pub struct ReviewFindings {
    pub has_issues: bool,
    pub code_review_output: Option<String>,
    pub security_output: Option<String>,
    pub qa_output: Option<String>,
    pub routing_hints: RoutingHints,
}

/// Build combined findings from the three reviewer agents' raw outputs.
/// A reviewer's raw output is attached only when it is failing.
pub fn build_review_findings(code_review: &str, security: &str, qa: &str) -> ReviewFindings {
    let mut hints = RoutingHints::default();
    let mut has_issues = false;

    let code_review_output = if classify(code_review) == Verdict::Failing {
        has_issues = true;
        hints.merge(extract_routing_hints(code_review));
        Some(code_review.to_string())
    } else {
        None
    };

    let security_output = if classify(security) == Verdict::Failing {
        has_issues = true;
        hints.merge(extract_routing_hints(security));
        Some(security.to_string())
    } else {
        None
    };

    let qa_output = if classify(qa) == Verdict::Failing {
        has_issues = true;
        hints.merge(extract_routing_hints(qa));
        Some(qa.to_string())
    } else {
        None
    };

    ReviewFindings {
        has_issues,
        code_review_output,
        security_output,
        qa_output,
        routing_hints: hints,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_empty_is_clean() {
        assert_eq!(classify(""), Verdict::Clean);
        assert_eq!(classify("   "), Verdict::Clean);
    }

    #[test]
    fn test_classify_pass_phrase_is_clean() {
        assert_eq!(classify("QA Review: Pass"), Verdict::Clean);
        assert_eq!(classify("Passed with no issues"), Verdict::Clean);
    }

    #[test]
    fn test_classify_json_status_pass_is_clean() {
        assert_eq!(classify(r#"{"status": "pass"}"#), Verdict::Clean);
    }

    #[test]
    fn test_classify_failing_markers() {
        assert_eq!(classify(r#"{"status":"fail","notes":"broken"}"#), Verdict::Failing);
        assert_eq!(classify("Found a [FAIL] in auth handler"), Verdict::Failing);
        assert_eq!(classify("This is a critical issue with the API"), Verdict::Failing);
        assert_eq!(classify("Severity: High — SQL injection risk"), Verdict::Failing);
    }

    #[test]
    fn test_extract_routing_hints_mixed() {
        let hints = extract_routing_hints("[frontend] broken layout, [backend] missing auth check");
        assert!(hints.frontend);
        assert!(hints.backend);
        assert!(!hints.styling);
    }

    #[test]
    fn test_build_review_findings_clean() {
        let findings = build_review_findings("QA Review: Pass", "safe for production", "");
        assert!(!findings.has_issues);
        assert!(findings.code_review_output.is_none());
        assert!(!findings.routing_hints.any());
    }

    #[test]
    fn test_build_review_findings_failing_with_hints() {
        let findings = build_review_findings(
            r#"{"status":"fail"} [frontend] button misaligned"#,
            "safe for production",
            "QA Review: Pass",
        );
        assert!(findings.has_issues);
        assert!(findings.code_review_output.is_some());
        assert!(findings.routing_hints.frontend);
        assert!(!findings.routing_hints.backend);
    }
}
