//! File Extractor: recovers files from a dev agent's free text when the
//! Agent Runner reported zero native `write_file`/`write_files` results.
//!
//! Only triggered as a fallback (see `agent::AgentOutcome::files_written`)
//! — the common path is native tool calls via the Tool Sandbox. The
//! markdown-fence fallback pattern described alongside `<tool_call>`
//! blocks is disabled by default and not implemented here.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use crate::tools::sanitize_path;

/// One file recovered from free text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ToolCallBody {
    name: String,
    parameters: ToolCallParams,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    path: String,
    content: String,
}

lazy_static! {
    static ref TOOL_CALL_RE: Regex = Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").unwrap();
    static ref PATH_FIELD_RE: Regex = Regex::new(r#""path"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap();
    static ref CONTENT_FIELD_RE: Regex = Regex::new(r#"(?s)"content"\s*:\s*"(.*)"\s*\}\s*\}"#).unwrap();
}

/// Extract every recoverable file from `text`, in document order, paths
/// sanitized and validated, duplicates dropped (first occurrence wins).
pub fn extract_files(text: &str) -> Vec<ExtractedFile> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for caps in TOOL_CALL_RE.captures_iter(text) {
        let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let Some(parsed) = parse_tool_call_body(body) else { continue };
        if parsed.name != "write_file" {
            continue;
        }

        let path = post_process_path(&parsed.parameters.path);
        if path.is_empty() || path_escapes(&path) {
            continue;
        }
        if !seen.insert(path.clone()) {
            continue;
        }

        let content = post_process_content(&parsed.parameters.content);
        files.push(ExtractedFile { path, content });
    }

    files
}

struct Parsed {
    name: String,
    parameters: ToolCallParams,
}

/// Try strict parse, then a newline-repaired reparse, then regex field recovery.
fn parse_tool_call_body(body: &str) -> Option<Parsed> {
    if let Ok(parsed) = serde_json::from_str::<ToolCallBody>(body) {
        return Some(Parsed { name: parsed.name, parameters: parsed.parameters });
    }

    let repaired = repair_raw_newlines(body);
    if let Ok(parsed) = serde_json::from_str::<ToolCallBody>(&repaired) {
        tracing::warn!("repaired malformed tool_call block before parsing");
        return Some(Parsed { name: parsed.name, parameters: parsed.parameters });
    }

    let path = PATH_FIELD_RE.captures(body)?.get(1)?.as_str().to_string();
    let content_raw = CONTENT_FIELD_RE.captures(body)?.get(1)?.as_str().to_string();
    tracing::warn!("recovered tool_call fields via regex after JSON parse failed");
    Some(Parsed {
        name: "write_file".to_string(),
        parameters: ToolCallParams {
            path: unescape_minimal(&path),
            content: unescape_minimal(&content_raw),
        },
    })
}

/// Escape raw (unescaped) newlines and carriage returns that appear
/// inside JSON string literals, so a model that forgot to `\n`-escape
/// its own multi-line `content` field can still be strictly parsed.
fn repair_raw_newlines(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            if escaped {
                out.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => {
                    out.push(c);
                    escaped = true;
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }

    out
}

fn unescape_minimal(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\\"", "\"").replace("\\\\", "\\")
}

fn post_process_path(raw: &str) -> String {
    sanitize_path(raw)
}

fn post_process_content(raw: &str) -> String {
    let no_bom = raw.trim_start_matches('\u{feff}');
    no_bom.replace("\r\n", "\n")
}

/// Reject a path that would escape a project root — the same
/// component-walk defense as the Tool Sandbox, but without a root to
/// join against (the extractor runs before any write is attempted).
fn path_escapes(sanitized: &str) -> bool {
    use std::path::Component;
    let mut depth: i64 = 0;
    for component in std::path::Path::new(sanitized).components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}

/// Structural parsing shape shared with the external Vitest/preview-runner
/// collaborator (§8 boundary test `parseVitest`). This crate implements
/// only this parsing shape, not the test-runner invocation itself.
#[derive(Debug, Clone, PartialEq)]
pub struct VitestFailure {
    pub name: String,
    pub message: String,
}

/// Parse a Vitest JSON report into a flat list of failures. A suite
/// collection error with no assertion results still reports as exactly
/// one failure, tagged `[Collection Error]`.
pub fn parse_vitest_report(report: &Value) -> Vec<VitestFailure> {
    let mut failures = Vec::new();

    let suites = report.get("testResults").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    for suite in &suites {
        let assertions = suite.get("assertionResults").and_then(|v| v.as_array()).cloned().unwrap_or_default();

        if assertions.is_empty() {
            if let Some(message) = suite.get("message").and_then(|v| v.as_str()) {
                if !message.is_empty() {
                    let name = suite
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown suite")
                        .to_string();
                    failures.push(VitestFailure {
                        name: format!("[Collection Error] {name}"),
                        message: message.to_string(),
                    });
                }
            }
            continue;
        }

        for assertion in &assertions {
            let status = assertion.get("status").and_then(|v| v.as_str()).unwrap_or("");
            if status == "failed" {
                let name = assertion
                    .get("fullName")
                    .or_else(|| assertion.get("title"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("unnamed test")
                    .to_string();
                let message = assertion
                    .get("failureMessages")
                    .and_then(|v| v.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                failures.push(VitestFailure { name, message });
            }
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_files_strict_json() {
        let text = r#"<tool_call>{"name":"write_file","parameters":{"path":"./src/App.tsx","content":"export default App;"}}</tool_call>"#;
        let files = extract_files(text);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "src/App.tsx");
        assert_eq!(files[0].content, "export default App;");
    }

    #[test]
    fn test_extract_files_repairs_raw_newlines() {
        let text = "<tool_call>{\"name\":\"write_file\",\"parameters\":{\"path\":\"src/App.tsx\",\"content\":\"line1\nline2\"}}</tool_call>";
        let files = extract_files(text);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "line1\nline2");
    }

    #[test]
    fn test_extract_files_strips_bom_and_normalizes_crlf() {
        let text = "<tool_call>{\"name\":\"write_file\",\"parameters\":{\"path\":\"a.ts\",\"content\":\"\\ufeffline1\\r\\nline2\"}}</tool_call>";
        let files = extract_files(text);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "line1\nline2");
    }

    #[test]
    fn test_extract_files_dedup_first_occurrence_wins() {
        let text = r#"
            <tool_call>{"name":"write_file","parameters":{"path":"a.ts","content":"first"}}</tool_call>
            <tool_call>{"name":"write_file","parameters":{"path":"a.ts","content":"second"}}</tool_call>
        "#;
        let files = extract_files(text);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "first");
    }

    #[test]
    fn test_extract_files_rejects_path_escape() {
        let text = r#"<tool_call>{"name":"write_file","parameters":{"path":"../../etc/passwd","content":"x"}}</tool_call>"#;
        let files = extract_files(text);
        assert!(files.is_empty());
    }

    #[test]
    fn test_extract_files_ignores_non_write_file_tool_calls() {
        let text = r#"<tool_call>{"name":"read_file","parameters":{"path":"a.ts"}}</tool_call>"#;
        let files = extract_files(text);
        assert!(files.is_empty());
    }

    #[test]
    fn test_parse_vitest_collection_error_reports_one_failure() {
        let report = json!({
            "testResults": [{
                "name": "App.test.tsx",
                "message": "SyntaxError: Unexpected token",
                "assertionResults": []
            }]
        });
        let failures = parse_vitest_report(&report);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].name.starts_with("[Collection Error]"));
    }

    #[test]
    fn test_parse_vitest_reports_failed_assertions() {
        let report = json!({
            "testResults": [{
                "name": "App.test.tsx",
                "assertionResults": [
                    {"status": "passed", "fullName": "renders"},
                    {"status": "failed", "fullName": "handles click", "failureMessages": ["expected true, got false"]}
                ]
            }]
        });
        let failures = parse_vitest_report(&report);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "handles click");
    }
}
