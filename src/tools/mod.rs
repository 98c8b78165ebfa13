//! Tool Sandbox: the five file tools exposed to agents, all scoped to a
//! single project root with path-traversal defense.

mod sandbox;

pub use sandbox::{sanitize_path, ListedNode, ToolContext, ToolSandbox};

use serde_json::{json, Value};

/// OpenAI function-call schema for the five sandbox tools, passed to the
/// Provider Gateway as the `tools` array.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "write_file",
                "description": "Write a single file, creating parent directories as needed.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "write_files",
                "description": "Write multiple files in one call.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "files": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "path": {"type": "string"},
                                    "content": {"type": "string"}
                                },
                                "required": ["path", "content"]
                            }
                        }
                    },
                    "required": ["files"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "read_file",
                "description": "Read a file's content. Returns a structured error if the file does not exist.",
                "parameters": {
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "list_files",
                "description": "List files under a directory (recursive), excluding hidden files and node_modules.",
                "parameters": {
                    "type": "object",
                    "properties": {"dir": {"type": "string"}},
                    "required": []
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "save_version",
                "description": "Save a labeled version checkpoint of the project.",
                "parameters": {
                    "type": "object",
                    "properties": {"label": {"type": "string"}},
                    "required": ["label"]
                }
            }
        }),
    ]
}
