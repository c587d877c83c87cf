//! Assistant tools that need app-level state: the metric collector and the
//! approval gate.

use crate::approval::ApprovalGate;
use crate::diagnosis::ActionType;
use crate::metrics::{MetricCollector, render_report};
use crate::sanitizer::sanitize;
use async_trait::async_trait;
use guardian_tools::{
    CommandRunner, LOCAL_HOST, RiskLevel, Tool, ToolError, ToolSpec, optional_string,
    require_string,
};
use std::sync::Arc;

const CONNECTIVITY_PROBE: &str = "echo ok";

fn target_host(arguments: &serde_json::Value) -> guardian_tools::Result<String> {
    Ok(optional_string(arguments, "target_host")?
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| LOCAL_HOST.to_string()))
}

pub struct SystemMetricsTool {
    runner: Arc<dyn CommandRunner>,
    collector: Arc<MetricCollector>,
}

impl SystemMetricsTool {
    pub fn new(runner: Arc<dyn CommandRunner>, collector: Arc<MetricCollector>) -> Self {
        Self { runner, collector }
    }
}

#[async_trait]
impl Tool for SystemMetricsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_system_metrics".to_string(),
            description: "Check CPU, RAM, disk, uptime and top processes of a host, each labeled NORMAL or HIGH."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "target_host": {"type": "string", "description": "Host name from the hosts file, default 'local'"}
                }
            }),
            risk_level: RiskLevel::Low,
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> guardian_tools::Result<serde_json::Value> {
        let host = target_host(&arguments)?;
        if let Err(e) = self.runner.run(CONNECTIVITY_PROBE, &host).await {
            return Ok(serde_json::json!({
                "host": host,
                "ok": false,
                "error": format!("Could not connect to host '{host}'. Details: {e}"),
            }));
        }
        let snapshot = self.collector.sample(&host).await;
        Ok(serde_json::json!({
            "host": host,
            "ok": true,
            "report": render_report(&snapshot, self.collector.thresholds()),
        }))
    }
}

/// `execute_terminal_command` for the assistant: the command is sanitized and
/// treated as an `investigate` action, so anything off the allow-list needs a
/// human decision before the inner tool runs it.
pub struct GatedCommandTool {
    inner: Arc<dyn Tool>,
    gate: Arc<ApprovalGate>,
}

impl GatedCommandTool {
    pub fn new(inner: Arc<dyn Tool>, gate: Arc<ApprovalGate>) -> Self {
        Self { inner, gate }
    }
}

#[async_trait]
impl Tool for GatedCommandTool {
    fn spec(&self) -> ToolSpec {
        self.inner.spec()
    }

    async fn execute(&self, mut arguments: serde_json::Value) -> guardian_tools::Result<serde_json::Value> {
        let command = sanitize(&require_string(&arguments, "command")?);
        if command.is_empty() {
            return Err(ToolError::InvalidArguments(
                "command is empty after sanitizing".to_string(),
            ));
        }
        let host = target_host(&arguments)?;

        let outcome = self
            .gate
            .decide(
                &command,
                ActionType::Investigate,
                &format!("Assistant requested `{command}` on {host}"),
            )
            .await;
        if !outcome.approved {
            return Err(ToolError::Unauthorized(format!(
                "command `{command}` was not approved ({})",
                outcome.provenance
            )));
        }

        arguments["command"] = serde_json::Value::String(command);
        self.inner.execute(arguments).await
    }
}
