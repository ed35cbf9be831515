//! Named tool lookup and execution.

use std::path::PathBuf;
use std::sync::Arc;

use super::arguments::ToolArguments;
use super::builtin::{all_tools, BuiltinSettings};
use super::tool::{Tool, ToolExecutionContext};
use super::types::ToolSchema;
use crate::error::AicliError;
use crate::types::{ToolCallRequest, ToolResult};

/// Set of tools the model may call.
///
/// Built once and then shared read-only behind an `Arc`.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    context: ToolExecutionContext,
}

impl ToolRegistry {
    /// Empty registry resolving paths against `working_dir`.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            tools: Vec::new(),
            context: ToolExecutionContext::new(working_dir),
        }
    }

    /// Registry preloaded with the built-in tools.
    pub fn with_builtins(working_dir: impl Into<PathBuf>, settings: &BuiltinSettings) -> Self {
        let mut registry = Self::new(working_dir);
        for tool in all_tools(settings) {
            registry.register(tool);
        }
        registry
    }

    /// Register a tool. A tool with the same name is replaced in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(idx) => self.tools[idx] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn working_dir(&self) -> &std::path::Path {
        &self.context.working_dir
    }

    /// Schemas in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    /// Run one tool call. Failures come back as a [`ToolResult`] with `error` set.
    pub async fn execute(&self, call: &ToolCallRequest) -> ToolResult {
        let Some(tool) = self.get(&call.name) else {
            tracing::warn!(tool = %call.name, "Model requested unknown tool");
            return ToolResult::failure(&call.id, format!("unknown tool: {}", call.name));
        };

        tracing::debug!(tool = %call.name, id = %call.id, "Executing tool");
        let args = ToolArguments::new(call.arguments.clone());
        match tool.execute(&args, &self.context).await {
            Ok(value) => ToolResult::success(&call.id, render_output(value)),
            Err(err) => {
                tracing::debug!(tool = %call.name, error = %err, "Tool failed");
                ToolResult::failure(&call.id, failure_message(err))
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("working_dir", &self.context.working_dir)
            .finish()
    }
}

fn render_output(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

fn failure_message(err: AicliError) -> String {
    match err {
        AicliError::ToolExecution { message, .. } => message,
        AicliError::InvalidArgument(message) => format!("invalid arguments: {message}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool::AgentTool;
    use crate::tools::types::AgentToolParameters;
    use crate::types::ToolArgumentMap;

    fn call(name: &str, args: serde_json::Value) -> ToolCallRequest {
        let serde_json::Value::Object(map) = args else {
            panic!("test arguments must be an object");
        };
        ToolCallRequest::new("call_1", name, map)
    }

    fn echo_tool(reply: &'static str) -> Arc<dyn Tool> {
        Arc::new(AgentTool::new(
            "echo",
            "Echo",
            AgentToolParameters::object().build(),
            move |_args, _ctx| async move { Ok(serde_json::json!(reply)) },
        ))
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_as_data() {
        let registry = ToolRegistry::new(".");
        let result = registry
            .execute(&ToolCallRequest::new("x", "teleport", ToolArgumentMap::new()))
            .await;
        assert_eq!(result.id, "x");
        assert_eq!(result.error.as_deref(), Some("unknown tool: teleport"));
    }

    #[tokio::test]
    async fn re_registering_replaces_in_place() {
        let mut registry = ToolRegistry::new(".");
        registry.register(echo_tool("first"));
        registry.register(echo_tool("second"));
        assert_eq!(registry.len(), 1);
        let result = registry.execute(&call("echo", serde_json::json!({}))).await;
        assert_eq!(result.output, "second");
    }

    #[tokio::test]
    async fn missing_argument_becomes_error_result() {
        let registry = ToolRegistry::with_builtins(".", &BuiltinSettings::default());
        let result = registry.execute(&call("read_file", serde_json::json!({}))).await;
        assert!(result.is_error());
        assert!(result.error.unwrap().contains("file_path"));
    }

    #[test]
    fn schemas_follow_registration_order() {
        let registry = ToolRegistry::with_builtins(".", &BuiltinSettings::default());
        let names: Vec<String> = registry.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names[0], "read_file");
        assert_eq!(names.len(), 5);
    }
}
