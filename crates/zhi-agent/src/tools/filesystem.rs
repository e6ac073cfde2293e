//! Filesystem tools: read, list, and write.
//!
//! Reads and listings are confined to the working directory. Writes go
//! through the [`OutputSandbox`] and never overwrite.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;
use zhi_core::utils::format_size;

use super::base::{optional_i64, optional_string, require_string, RiskTier, Tool};
use super::documents::{render_docx, render_xlsx};
use crate::error::ToolFailure;
use crate::sandbox::{validate_relative, OutputSandbox};

/// Largest file `file_read` returns in full.
const MAX_READ_SIZE: u64 = 100 * 1024;

/// Bytes sampled for the binary check.
const BINARY_SAMPLE: usize = 8192;

const DEFAULT_LIST_DEPTH: i64 = 2;
const MAX_LIST_DEPTH: i64 = 10;

// ─────────────────────────────────────────────
// Shared path helper
// ─────────────────────────────────────────────

/// Resolve a relative path inside `working_dir`, following symlinks and
/// rejecting anything that lands outside it. `"."` is the directory itself.
fn resolve_in_workdir(working_dir: &Path, path: &str) -> anyhow::Result<PathBuf> {
    let root = working_dir
        .canonicalize()
        .with_context(|| format!("Working directory unavailable: {}", working_dir.display()))?;

    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == "./" {
        return Ok(root);
    }

    let rel = validate_relative(trimmed)?;
    let joined = root.join(&rel);
    let resolved = match joined.canonicalize() {
        Ok(p) => p,
        // Missing targets are reported by the caller.
        Err(_) => return Ok(joined),
    };
    if !resolved.starts_with(&root) {
        anyhow::bail!("Path is outside the working directory.");
    }
    Ok(resolved)
}

// ─────────────────────────────────────────────
// FileReadTool
// ─────────────────────────────────────────────

/// Reads a text file under the working directory.
pub struct FileReadTool {
    working_dir: PathBuf,
}

impl FileReadTool {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file. \
         Only relative paths within the working directory are allowed. \
         Maximum file size: 100KB (truncated with warning if larger)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Relative path to the file to read."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let path_str = require_string(&params, "path")?;
        let path = resolve_in_workdir(&self.working_dir, &path_str)?;

        if !path.exists() {
            anyhow::bail!("File not found: {path_str}");
        }
        if !path.is_file() {
            anyhow::bail!("Not a file: {path_str}");
        }

        let size = std::fs::metadata(&path)
            .with_context(|| format!("Could not read file: {path_str}"))?
            .len();
        let mut file =
            std::fs::File::open(&path).with_context(|| format!("Could not read file: {path_str}"))?;
        let mut raw = Vec::new();
        file.by_ref()
            .take(MAX_READ_SIZE)
            .read_to_end(&mut raw)
            .with_context(|| format!("Could not read file: {path_str}"))?;

        if raw[..raw.len().min(BINARY_SAMPLE)].contains(&0) {
            anyhow::bail!("File appears to be binary: {path_str}");
        }

        let content = String::from_utf8_lossy(&raw).into_owned();
        debug!(path = %path.display(), bytes = size, "file read");
        if size > MAX_READ_SIZE {
            return Ok(format!(
                "[truncated, showing first 100KB of {}]\n{content}",
                format_size(size)
            ));
        }
        Ok(content)
    }
}

// ─────────────────────────────────────────────
// FileListTool
// ─────────────────────────────────────────────

/// Lists a directory tree with sizes and modification times.
pub struct FileListTool {
    working_dir: PathBuf,
}

impl FileListTool {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for FileListTool {
    fn name(&self) -> &str {
        "file_list"
    }

    fn description(&self) -> &str {
        "List files and directories with name, size, and modification date. \
         Only relative paths within the working directory are allowed."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Relative path to list. Defaults to current directory.",
                    "default": "."
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Maximum depth to recurse. Defaults to 2.",
                    "default": 2
                }
            }
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let path_str = optional_string(&params, "path").unwrap_or_else(|| ".".into());
        let depth = optional_i64(&params, "max_depth")
            .unwrap_or(DEFAULT_LIST_DEPTH)
            .clamp(1, MAX_LIST_DEPTH) as usize;

        let dir = resolve_in_workdir(&self.working_dir, &path_str)?;
        if !dir.exists() {
            anyhow::bail!("Directory not found: {path_str}");
        }
        if !dir.is_dir() {
            anyhow::bail!("Not a directory: {path_str}");
        }

        let mut lines = Vec::new();
        list_dir(&dir, "", depth, &mut lines);

        if lines.is_empty() {
            return Ok(format!("Directory is empty: {path_str}"));
        }
        Ok(lines.join("\n"))
    }
}

fn list_dir(dir: &Path, prefix: &str, remaining: usize, lines: &mut Vec<String>) {
    if remaining == 0 {
        return;
    }

    let mut entries: Vec<_> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
        Err(_) => {
            lines.push(format!("{prefix}[permission denied]"));
            return;
        }
    };
    entries.sort_by_key(|e| (!e.path().is_dir(), e.file_name().to_string_lossy().to_lowercase()));

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let Ok(meta) = std::fs::metadata(&path) else {
            lines.push(format!("{prefix}[?] {name}"));
            continue;
        };

        let (kind, size) = if meta.is_dir() {
            ("d", "-".to_string())
        } else {
            ("f", format_size(meta.len()))
        };
        let mtime = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        lines.push(format!("{prefix}[{kind}] {name:<30} {size:>10}  {mtime}"));

        // Symlinked directories are listed but not descended into.
        let is_link = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
        if meta.is_dir() && !is_link {
            list_dir(&path, &format!("{prefix}  "), remaining - 1, lines);
        }
    }
}

// ─────────────────────────────────────────────
// FileWriteTool
// ─────────────────────────────────────────────

/// Writes a new file into the output sandbox.
///
/// `.md`/`.txt` take plain text, `.json` any JSON value (pretty-printed),
/// `.csv` a `{"headers": [...], "rows": [[...]]}` object, `.xlsx`
/// `{"sheets": [{name, headers, rows}]}`, and `.docx` `{"content": markdown}`.
pub struct FileWriteTool {
    sandbox: OutputSandbox,
}

impl FileWriteTool {
    pub fn new(sandbox: OutputSandbox) -> Self {
        Self { sandbox }
    }

    pub fn sandbox(&self) -> &OutputSandbox {
        &self.sandbox
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write a new file to the output directory. \
         Supports: .md, .txt (plain text), .json (any JSON), .csv ({headers, rows}), \
         .xlsx ({sheets: [{name, headers, rows}]}), .docx ({content: \"markdown\"}). \
         Cannot overwrite existing files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Relative path within the output directory for the new file."
                },
                "content": {
                    "description": "File content. For .md/.txt: plain text string. \
                                    For .json: any JSON value. \
                                    For .csv: {\"headers\": [...], \"rows\": [[...]]}. \
                                    For .xlsx: {sheets: [{name, headers, rows}]}. \
                                    For .docx: {content: markdown string}."
                }
            },
            "required": ["path", "content"]
        })
    }

    fn risk_tier(&self) -> RiskTier {
        RiskTier::High
    }

    fn preflight(&self, params: &HashMap<String, Value>) -> Result<(), ToolFailure> {
        // A missing path is reported by execute().
        if let Some(path) = optional_string(params, "path") {
            self.sandbox.resolve_new(&path)?;
        }
        Ok(())
    }

    fn describe_call(&self, params: &HashMap<String, Value>) -> String {
        let path = optional_string(params, "path").unwrap_or_default();
        format!("file_write → {}", self.sandbox.root().join(path).display())
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let path_str = require_string(&params, "path")?;
        let content = params
            .get("content")
            .filter(|v| !v.is_null())
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: content"))?;

        let target = self.sandbox.resolve_new(&path_str)?;
        let ext = target
            .as_path()
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let body: Vec<u8> = match ext.as_str() {
            "json" => render_json(content)?.into_bytes(),
            "csv" => render_csv(content)?.into_bytes(),
            "xlsx" => render_xlsx(content)?,
            "docx" => render_docx(content)?,
            _ => render_text(content).into_bytes(),
        };

        let written = target
            .write_new(&body)
            .with_context(|| format!("Could not write file: {path_str}"))?;
        debug!(path = %target.as_path().display(), bytes = written, "file written");
        Ok(format!("File written: {path_str} ({})", format_size(written)))
    }
}

fn render_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_json(content: &Value) -> anyhow::Result<String> {
    match content {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => Ok(serde_json::to_string_pretty(&parsed)?),
            Err(_) => Ok(s.clone()),
        },
        other => Ok(serde_json::to_string_pretty(other)?),
    }
}

fn render_csv(content: &Value) -> anyhow::Result<String> {
    let parsed;
    let table = match content {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(v) => {
                parsed = v;
                &parsed
            }
            // Plain CSV text is written as given.
            Err(_) => return Ok(s.clone()),
        },
        other => other,
    };

    let Some(obj) = table.as_object() else {
        anyhow::bail!(r#"CSV content must be {{"headers": [...], "rows": [[...]]}}."#);
    };

    let mut out = String::new();
    if let Some(headers) = obj.get("headers").and_then(|h| h.as_array()) {
        if !headers.is_empty() {
            push_csv_row(&mut out, headers);
        }
    }
    if let Some(rows) = obj.get("rows").and_then(|r| r.as_array()) {
        for row in rows {
            match row.as_array() {
                Some(cells) => push_csv_row(&mut out, cells),
                None => push_csv_row(&mut out, std::slice::from_ref(row)),
            }
        }
    }
    Ok(out)
}

fn push_csv_row(out: &mut String, cells: &[Value]) {
    let row: Vec<String> = cells.iter().map(csv_cell).collect();
    out.push_str(&row.join(","));
    out.push('\n');
}

fn csv_cell(value: &Value) -> String {
    let raw = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}
