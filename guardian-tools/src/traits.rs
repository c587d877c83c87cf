use crate::error::{Result, ToolError};
use async_trait::async_trait;

/// How much damage a tool call can do to the monitored host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    /// Reads state or talks to the outside world only.
    Low,
    /// Runs arbitrary commands; callers route it through the approval gate.
    High,
}

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub risk_level: RiskLevel,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value>;
}

pub fn to_llm_tool_def(tool: &dyn Tool) -> guardian_llm::ToolDefinition {
    let spec = tool.spec();
    guardian_llm::ToolDefinition {
        name: spec.name,
        description: spec.description,
        parameters: spec.parameters_schema,
    }
}

pub fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_u64(args: &serde_json::Value, key: &str) -> Result<Option<u64>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            ToolError::InvalidArguments(format!("key {key} must be a non-negative integer"))
        }),
        // Local models routinely quote numbers.
        Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().map(Some).map_err(|_| {
            ToolError::InvalidArguments(format!("key {key} must be an integer, got {s:?}"))
        }),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "key {key} must be an integer, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_helpers_distinguish_missing_and_wrong_type() {
        let args = json!({"command": "uptime", "target_host": null, "lines": 5});
        assert_eq!(require_string(&args, "command").unwrap(), "uptime");
        assert!(require_string(&args, "query").is_err());
        assert_eq!(optional_string(&args, "target_host").unwrap(), None);
        assert!(optional_string(&args, "lines").is_err());
    }

    #[test]
    fn optional_u64_accepts_quoted_numbers() {
        assert_eq!(optional_u64(&json!({"lines": 20}), "lines").unwrap(), Some(20));
        assert_eq!(optional_u64(&json!({"lines": "15"}), "lines").unwrap(), Some(15));
        assert_eq!(optional_u64(&json!({}), "lines").unwrap(), None);
        assert!(optional_u64(&json!({"lines": -1}), "lines").is_err());
    }
}
