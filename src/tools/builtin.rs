//! Built-in tools offered to every provider.
//!
//! Five tools (`read_file`, `write_file`, `list_files`, `run_command`,
//! `search_files`) let a model inspect and change the local filesystem and run
//! shell commands. Relative paths resolve against the
//! [`ToolExecutionContext::working_dir`]. Each tool is constructed via
//! [`AgentTool::new`] and returned as `Arc<dyn Tool>`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use aicli::tools::builtin::{all_tools, BuiltinSettings};
//!
//! let tools = all_tools(&BuiltinSettings::default());
//! assert_eq!(tools.len(), 5);
//! ```

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::AgentSettings;
use crate::error::AicliError;
use crate::tools::tool::{AgentTool, Tool, ToolExecutionContext};
use crate::tools::types::AgentToolParameters;
use crate::util::process::{isolate, ProcessGroup};
use crate::util::text::truncate_with_notice;

const READ_FILE_MAX_BYTES: usize = 65_536;
const COMMAND_OUTPUT_MAX_BYTES: usize = 32_768;
const SEARCH_EXCERPT_MAX_CHARS: usize = 200;

/// Limits for the built-in tools.
#[derive(Debug, Clone)]
pub struct BuiltinSettings {
    pub command_timeout: Duration,
    pub max_search_results: usize,
}

impl Default for BuiltinSettings {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for BuiltinSettings {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            command_timeout: Duration::from_secs(settings.command_timeout_secs),
            max_search_results: settings.max_search_results,
        }
    }
}

/// Create the `read_file` tool, which reads a file as UTF-8 text.
///
/// Content is capped at 64 KiB with a trailing note when truncated.
pub fn read_file_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "read_file",
        "Read the contents of a file",
        AgentToolParameters::object()
            .string("file_path", "Path to the file to read", true)
            .build(),
        |args, ctx: ToolExecutionContext| async move {
            let file_path = args.get_str("file_path")?;
            let path = ctx.resolve(file_path);

            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                let message = if e.kind() == std::io::ErrorKind::NotFound {
                    format!("file not found: {file_path}")
                } else {
                    format!("{file_path}: {e}")
                };
                AicliError::tool("read_file", message)
            })?;

            Ok(serde_json::Value::String(truncate_with_notice(
                &content,
                READ_FILE_MAX_BYTES,
            )))
        },
    ))
}

/// Create the `write_file` tool, which writes content to a file.
///
/// Creates parent directories when they do not exist.
pub fn write_file_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "write_file",
        "Write content to a file, creating parent directories if needed",
        AgentToolParameters::object()
            .string("file_path", "Path to the file to write", true)
            .string("content", "Content to write to the file", true)
            .build(),
        |args, ctx: ToolExecutionContext| async move {
            let file_path = args.get_str("file_path")?;
            let content = args.get_str("content")?;
            let path = ctx.resolve(file_path);

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        AicliError::tool(
                            "write_file",
                            format!("failed to create directories for {file_path}: {e}"),
                        )
                    })?;
                }
            }

            tokio::fs::write(&path, content)
                .await
                .map_err(|e| AicliError::tool("write_file", format!("{file_path}: {e}")))?;

            Ok(serde_json::Value::String(format!(
                "Wrote {} bytes to {file_path}",
                content.len()
            )))
        },
    ))
}

/// Create the `list_files` tool.
///
/// Returns sorted entry names, one per line, with directories suffixed by `/`.
/// An optional glob pattern filters the names.
pub fn list_files_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "list_files",
        "List files and directories in a directory",
        AgentToolParameters::object()
            .string("directory", "Directory to list", true)
            .string("pattern", "Optional glob pattern such as *.rs", false)
            .build(),
        |args, ctx: ToolExecutionContext| async move {
            let directory = args.get_str("directory")?;
            let filter = args
                .get_str_opt("pattern")
                .map(glob::Pattern::new)
                .transpose()
                .map_err(|e| AicliError::tool("list_files", format!("invalid pattern: {e}")))?;
            let path = ctx.resolve(directory);

            let mut read_dir = tokio::fs::read_dir(&path).await.map_err(|e| {
                let message = if e.kind() == std::io::ErrorKind::NotFound {
                    format!("directory not found: {directory}")
                } else {
                    format!("{directory}: {e}")
                };
                AicliError::tool("list_files", message)
            })?;

            let mut entries = Vec::new();
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| AicliError::tool("list_files", e.to_string()))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(filter) = &filter {
                    if !filter.matches(&name) {
                        continue;
                    }
                }
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                entries.push(if is_dir { format!("{name}/") } else { name });
            }
            entries.sort();

            if entries.is_empty() {
                return Ok(serde_json::Value::String(format!(
                    "No entries in {directory}"
                )));
            }
            Ok(serde_json::Value::String(entries.join("\n")))
        },
    ))
}

/// Create the `run_command` tool, which executes a command via `sh -c`.
///
/// Captures stdout and stderr and reports the exit status. The shell runs in
/// its own process group, and the whole group is killed when the command
/// finishes, the timeout elapses, or the call is abandoned.
pub fn run_command_tool(timeout: Duration) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "run_command",
        "Execute a shell command and return its output",
        AgentToolParameters::object()
            .string("command", "The shell command to execute", true)
            .string(
                "working_directory",
                "Directory to run the command in",
                false,
            )
            .build(),
        move |args, ctx: ToolExecutionContext| async move {
            let command = args.get_str("command")?;
            let cwd = match args.get_str_opt("working_directory") {
                Some(dir) => ctx.resolve(dir),
                None => ctx.working_dir.clone(),
            };

            tracing::debug!(command, cwd = %cwd.display(), "Running command");

            let mut shell = tokio::process::Command::new("sh");
            shell
                .arg("-c")
                .arg(command)
                .current_dir(&cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            let child = isolate(&mut shell)
                .spawn()
                .map_err(|e| AicliError::tool("run_command", e.to_string()))?;
            // Killed on every exit path, so `cmd &` cannot outlive the call.
            let _group = ProcessGroup::of(&child);

            let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(AicliError::tool("run_command", e.to_string())),
                Err(_) => {
                    return Err(AicliError::tool(
                        "run_command",
                        format!("command timed out after {}s", timeout.as_secs_f64()),
                    ));
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut combined = String::new();
            if !stdout.is_empty() {
                combined.push_str(&format!("STDOUT:\n{stdout}\n"));
            }
            if !stderr.is_empty() {
                combined.push_str(&format!("STDERR:\n{stderr}\n"));
            }
            match output.status.code() {
                Some(code) => combined.push_str(&format!("Exit code: {code}")),
                None => combined.push_str("Exit code: terminated by signal"),
            }

            Ok(serde_json::Value::String(truncate_with_notice(
                &combined,
                COMMAND_OUTPUT_MAX_BYTES,
            )))
        },
    ))
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    pattern: String,
    #[serde(default = "current_dir_arg")]
    directory: String,
    #[serde(default)]
    file_pattern: Option<String>,
}

fn current_dir_arg() -> String {
    ".".to_string()
}

/// Create the `search_files` tool, a case-insensitive regex search.
///
/// Emits `path:line: excerpt` lines, paths relative to the searched directory.
/// Binary and unreadable files are skipped.
pub fn search_files_tool(max_results: usize) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "search_files",
        "Search for a regular expression in files under a directory",
        AgentToolParameters::object()
            .string("pattern", "Regular expression to search for (case-insensitive)", true)
            .string("directory", "Directory to search in", true)
            .string("file_pattern", "Optional glob on file names such as *.py", false)
            .build(),
        move |args, ctx: ToolExecutionContext| async move {
            let search: SearchArgs = args.deserialize()?;
            let regex = regex::RegexBuilder::new(&search.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| AicliError::tool("search_files", format!("invalid pattern: {e}")))?;
            let file_filter = search
                .file_pattern
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(glob::Pattern::new)
                .transpose()
                .map_err(|e| {
                    AicliError::tool("search_files", format!("invalid file pattern: {e}"))
                })?;
            let root = ctx.resolve(&search.directory);
            if !root.exists() {
                return Err(AicliError::tool(
                    "search_files",
                    format!("directory not found: {}", search.directory),
                ));
            }

            let output = tokio::task::spawn_blocking(move || {
                search_tree(&root, &regex, file_filter.as_ref(), max_results)
            })
            .await
            .map_err(|e| AicliError::tool("search_files", format!("search task failed: {e}")))?;

            Ok(serde_json::Value::String(output))
        },
    ))
}

fn search_tree(
    root: &Path,
    regex: &regex::Regex,
    file_filter: Option<&glob::Pattern>,
    max_results: usize,
) -> String {
    let mut files: Vec<_> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            file_filter
                .map(|f| f.matches(&e.file_name().to_string_lossy()))
                .unwrap_or(true)
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut lines = Vec::new();
    let mut truncated = false;
    'files: for path in files {
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        if bytes.contains(&0) {
            continue;
        }
        let Ok(content) = String::from_utf8(bytes) else {
            continue;
        };
        let rel = path.strip_prefix(root).unwrap_or(&path);
        for (idx, line) in content.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            if lines.len() >= max_results {
                truncated = true;
                break 'files;
            }
            let excerpt: String = line.trim().chars().take(SEARCH_EXCERPT_MAX_CHARS).collect();
            lines.push(format!("{}:{}: {excerpt}", rel.display(), idx + 1));
        }
    }

    if lines.is_empty() {
        return "No matches found".to_string();
    }
    let mut out = lines.join("\n");
    if truncated {
        out.push_str(&format!("\n... (results truncated at {max_results} matches)"));
    }
    out
}

/// Return all built-in tools.
pub fn all_tools(settings: &BuiltinSettings) -> Vec<Arc<dyn Tool>> {
    vec![
        read_file_tool(),
        write_file_tool(),
        list_files_tool(),
        run_command_tool(settings.command_timeout),
        search_files_tool(settings.max_search_results),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::arguments::ToolArguments;

    fn ctx(dir: &Path) -> ToolExecutionContext {
        ToolExecutionContext::new(dir)
    }

    fn args(json: serde_json::Value) -> ToolArguments {
        ToolArguments::from_value(json).unwrap()
    }

    fn text(value: serde_json::Value) -> String {
        value.as_str().unwrap().to_string()
    }

    #[test]
    fn all_tools_contains_expected_names() {
        let tools = all_tools(&BuiltinSettings::default());
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec!["read_file", "write_file", "list_files", "run_command", "search_files"]
        );
        for tool in &tools {
            assert_eq!(tool.parameters().schema["type"], "object");
        }
    }

    #[tokio::test]
    async fn read_file_resolves_relative_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello world").unwrap();

        let out = read_file_tool()
            .execute(&args(serde_json::json!({"file_path": "hello.txt"})), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(text(out), "hello world");
    }

    #[tokio::test]
    async fn read_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file_tool()
            .execute(&args(serde_json::json!({"file_path": "nope.txt"})), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("file not found: nope.txt"));
    }

    #[tokio::test]
    async fn read_file_truncates_large_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(READ_FILE_MAX_BYTES + 10)).unwrap();
        let out = read_file_tool()
            .execute(&args(serde_json::json!({"file_path": "big.txt"})), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(text(out).contains("[truncated 10 of"));
    }

    #[tokio::test]
    async fn write_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let out = write_file_tool()
            .execute(
                &args(serde_json::json!({"file_path": "a/b/c.txt", "content": "nested"})),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(text(out), "Wrote 6 bytes to a/b/c.txt");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a/b/c.txt")).unwrap(),
            "nested"
        );
    }

    #[tokio::test]
    async fn list_files_sorts_and_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zebra.txt"), "").unwrap();
        std::fs::write(dir.path().join("alpha.rs"), "").unwrap();
        std::fs::create_dir(dir.path().join("middle")).unwrap();

        let out = list_files_tool()
            .execute(&args(serde_json::json!({"directory": "."})), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(text(out), "alpha.rs\nmiddle/\nzebra.txt");

        let filtered = list_files_tool()
            .execute(
                &args(serde_json::json!({"directory": ".", "pattern": "*.rs"})),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(text(filtered), "alpha.rs");
    }

    #[tokio::test]
    async fn run_command_reports_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command_tool(Duration::from_secs(10))
            .execute(
                &args(serde_json::json!({"command": "echo hi; echo oops >&2; exit 3"})),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        let out = text(out);
        assert!(out.contains("STDOUT:\nhi"));
        assert!(out.contains("STDERR:\noops"));
        assert!(out.ends_with("Exit code: 3"));
    }

    #[tokio::test]
    async fn run_command_uses_working_directory_argument() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("marker"), "").unwrap();
        let out = run_command_tool(Duration::from_secs(10))
            .execute(
                &args(serde_json::json!({"command": "ls", "working_directory": "sub"})),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(text(out).contains("marker"));
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command_tool(Duration::from_millis(200))
            .execute(&args(serde_json::json!({"command": "sleep 5"})), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "got: {err}");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_backgrounded_grandchildren() {
        use crate::util::process::tests::{read_pid, wait_until_gone};

        let dir = tempfile::tempdir().unwrap();
        let err = run_command_tool(Duration::from_millis(500))
            .execute(
                &args(serde_json::json!({"command": "sleep 60 & echo $! > bg.pid; sleep 60"})),
                &ctx(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "got: {err}");

        let sleeper = read_pid(&dir.path().join("bg.pid")).await;
        assert!(wait_until_gone(sleeper).await, "background sleep {sleeper} survived");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn finished_command_leaves_no_background_processes() {
        use crate::util::process::tests::{read_pid, wait_until_gone};

        let dir = tempfile::tempdir().unwrap();
        let out = run_command_tool(Duration::from_secs(10))
            .execute(
                &args(serde_json::json!({
                    "command": "sleep 60 >/dev/null 2>&1 & echo $! > bg.pid; echo started"
                })),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(text(out).contains("started"));

        let sleeper = read_pid(&dir.path().join("bg.pid")).await;
        assert!(wait_until_gone(sleeper).await, "background sleep {sleeper} survived");
    }

    #[tokio::test]
    async fn search_files_is_case_insensitive_and_respects_file_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "import os\nHELLO = 1\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "hello there\n").unwrap();
        std::fs::write(dir.path().join("blob.bin"), b"hello\0world").unwrap();

        let out = search_files_tool(200)
            .execute(
                &args(serde_json::json!({"pattern": "hello", "directory": "."})),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(text(out), "a.py:2: HELLO = 1\nb.txt:1: hello there");

        let only_py = search_files_tool(200)
            .execute(
                &args(serde_json::json!({
                    "pattern": "hello",
                    "directory": ".",
                    "file_pattern": "*.py",
                })),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(text(only_py), "a.py:2: HELLO = 1");
    }

    #[tokio::test]
    async fn search_files_caps_result_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("many.txt"), "match\n".repeat(10)).unwrap();

        let out = search_files_tool(3)
            .execute(
                &args(serde_json::json!({"pattern": "match", "directory": "."})),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        let out = text(out);
        assert_eq!(out.lines().filter(|l| l.starts_with("many.txt:")).count(), 3);
        assert!(out.contains("results truncated at 3 matches"));
    }
}
