//! Typed access to tool call arguments.

use crate::error::AicliError;
use crate::types::ToolArgumentMap;

/// Wrapper around tool call arguments providing typed extraction.
#[derive(Debug, Clone, Default)]
pub struct ToolArguments {
    values: ToolArgumentMap,
}

impl ToolArguments {
    pub fn new(values: ToolArgumentMap) -> Self {
        Self { values }
    }

    /// Build from a JSON value. Anything but an object is rejected.
    pub fn from_value(value: serde_json::Value) -> Result<Self, AicliError> {
        match value {
            serde_json::Value::Object(values) => Ok(Self { values }),
            serde_json::Value::Null => Ok(Self::default()),
            other => Err(AicliError::InvalidArgument(format!(
                "tool arguments must be a JSON object, got {other}"
            ))),
        }
    }

    /// Get the raw argument map.
    pub fn raw(&self) -> &ToolArgumentMap {
        &self.values
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, AicliError> {
        self.values
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| AicliError::InvalidArgument(format!("Missing string argument: {key}")))
    }

    /// Get an optional string argument. Empty strings count as absent.
    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Deserialize the entire arguments into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, AicliError> {
        serde_json::from_value(serde_json::Value::Object(self.values.clone())).map_err(|e| {
            AicliError::InvalidArgument(format!("Failed to deserialize arguments: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_object_values() {
        assert!(ToolArguments::from_value(json!(["a"])).is_err());
        assert!(ToolArguments::from_value(json!("path")).is_err());
        assert!(ToolArguments::from_value(json!(null)).unwrap().raw().is_empty());
    }

    #[test]
    fn missing_string_names_the_key() {
        let args = ToolArguments::from_value(json!({"directory": "."})).unwrap();
        assert_eq!(args.get_str("directory").unwrap(), ".");
        let err = args.get_str("pattern").unwrap_err();
        assert!(err.to_string().contains("pattern"));
        assert_eq!(args.get_str_opt("pattern"), None);
    }
}
