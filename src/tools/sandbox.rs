//! File tools scoped to a single project root.
//!
//! Every path a tool call names is sanitized then resolved against the
//! sandbox root; a resolved path that would land outside the root is
//! rejected with `PathEscape` rather than ever touching the filesystem.

use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Per-invocation identity the sandbox's tools are scoped to.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub project_id: Option<String>,
    pub chat_id: Option<String>,
}

/// One node of a `list_files` tree.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ListedNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ListedNode>>,
}

/// Sanitize a model-supplied path before it is ever joined to the
/// project root: strip surrounding quotes/backticks/whitespace, strip a
/// leading `./`, and normalize backslashes to forward slashes.
///
/// Idempotent: `sanitize_path(sanitize_path(x)) == sanitize_path(x)`.
pub fn sanitize_path(raw: &str) -> String {
    let mut s = raw.trim().to_string();

    loop {
        let before = s.clone();
        s = s
            .trim_matches(|c: char| c == '\'' || c == '"' || c == '`')
            .trim()
            .to_string();
        s = s.replace('\\', "/");
        while let Some(stripped) = s.strip_prefix("./") {
            s = stripped.to_string();
        }
        if s == before {
            break;
        }
    }

    s
}

/// Resolve a sanitized relative path against `root`, rejecting any path
/// that would escape it (via `..`, an absolute path, etc.) without ever
/// touching the filesystem (the target file may not exist yet).
fn resolve(root: &Path, raw_path: &str) -> Result<PathBuf> {
    let sanitized = sanitize_path(raw_path);
    if sanitized.is_empty() {
        return Err(Error::PathEscape("empty path".to_string()));
    }

    let mut depth: i64 = 0;
    let mut normalized = PathBuf::new();
    for component in Path::new(&sanitized).components() {
        match component {
            Component::Normal(part) => {
                depth += 1;
                normalized.push(part);
            }
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::PathEscape(sanitized));
                }
                normalized.pop();
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathEscape(sanitized));
            }
        }
    }

    Ok(root.join(normalized))
}

/// File tools scoped to one project root, with a rate limit on
/// `save_version` calls per pipeline run.
pub struct ToolSandbox {
    root: PathBuf,
    versions_saved: AtomicU32,
    max_versions: u32,
}

impl ToolSandbox {
    pub fn new(root: impl Into<PathBuf>, max_versions: u32) -> Self {
        Self {
            root: root.into(),
            versions_saved: AtomicU32::new(0),
            max_versions,
        }
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<Value> {
        let resolved = resolve(&self.root, path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, content).await?;
        Ok(json!({"success": true, "path": sanitize_path(path)}))
    }

    pub async fn write_files(&self, files: &[(String, String)]) -> Result<Value> {
        let mut written = Vec::new();
        for (path, content) in files {
            self.write_file(path, content).await?;
            written.push(sanitize_path(path));
        }
        Ok(json!({"success": true, "paths": written}))
    }

    pub async fn read_file(&self, path: &str) -> Result<Value> {
        let resolved = resolve(&self.root, path)?;
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => Ok(json!({"content": content})),
            Err(_) => Ok(json!({"error": "File not found"})),
        }
    }

    pub async fn list_files(&self, dir: Option<&str>) -> Result<Value> {
        let start = match dir {
            Some(d) if !d.is_empty() => resolve(&self.root, d)?,
            _ => self.root.clone(),
        };
        let nodes = list_recursive(&self.root, &start).await?;
        Ok(serde_json::to_value(nodes)?)
    }

    pub async fn save_version(&self, label: &str) -> Result<Value> {
        let prior = self.versions_saved.fetch_add(1, Ordering::SeqCst);
        if prior >= self.max_versions {
            return Err(Error::VersionLimitReached);
        }
        Ok(json!({"success": true, "label": label}))
    }
}

fn is_excluded(name: &str) -> bool {
    name.starts_with('.') || name == "node_modules"
}

fn list_recursive<'a>(
    root: &'a Path,
    dir: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<ListedNode>>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut nodes = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_excluded(&name) {
                continue;
            }
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                let children = list_recursive(root, &path).await?;
                nodes.push(ListedNode {
                    name,
                    path: rel,
                    node_type: "directory",
                    children: Some(children),
                });
            } else {
                nodes.push(ListedNode {
                    name,
                    path: rel,
                    node_type: "file",
                    children: None,
                });
            }
        }

        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    })
}

#[async_trait::async_trait]
impl crate::provider::ToolDispatch for ToolSandbox {
    async fn call(&self, name: &str, input: Value) -> Result<Value> {
        match name {
            "write_file" => {
                let path = input.get("path").and_then(|v| v.as_str()).unwrap_or_default();
                let content = input.get("content").and_then(|v| v.as_str()).unwrap_or_default();
                self.write_file(path, content).await
            }
            "write_files" => {
                let files = input
                    .get("files")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|f| {
                                let path = f.get("path")?.as_str()?.to_string();
                                let content = f.get("content")?.as_str()?.to_string();
                                Some((path, content))
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                self.write_files(&files).await
            }
            "read_file" => {
                let path = input.get("path").and_then(|v| v.as_str()).unwrap_or_default();
                self.read_file(path).await
            }
            "list_files" => {
                let dir = input.get("dir").and_then(|v| v.as_str());
                self.list_files(dir).await
            }
            "save_version" => {
                let label = input.get("label").and_then(|v| v.as_str()).unwrap_or("checkpoint");
                self.save_version(label).await
            }
            other => Err(Error::Other(format!("unknown tool: {other}"))),
        }
    }
}

/// Wraps a `ToolSandbox` so it can be shared across concurrently-running
/// steps while a single project root enforces single-writer semantics by
/// construction (the scheduler never dispatches two writers to
/// overlapping paths within a run).
pub type SharedSandbox = Arc<ToolSandbox>;
