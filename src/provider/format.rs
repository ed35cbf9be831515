//! Provider formatting helpers shared by the wire encoders.

use crate::error::AicliError;
use crate::types::ToolResult;

/// Text payload sent back to a provider for a tool result.
pub(crate) fn tool_result_content(result: &ToolResult) -> String {
    result.model_text()
}

/// Parse an accumulated argument buffer into an argument object.
///
/// An empty buffer means "no arguments". Anything other than a JSON object is
/// a protocol error.
pub(crate) fn parse_tool_arguments(
    tool_name: &str,
    raw: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, AicliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(serde_json::Map::new());
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(AicliError::protocol(format!(
            "arguments for tool '{tool_name}' are not a JSON object: {other}"
        ))),
        Err(e) => Err(AicliError::protocol(format!(
            "malformed arguments for tool '{tool_name}': {e}"
        ))),
    }
}

/// Fresh opaque call id for backends that do not provide one.
pub(crate) fn generated_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
