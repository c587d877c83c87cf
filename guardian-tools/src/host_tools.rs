use crate::error::{Result, ToolError};
use crate::hosts::LOCAL_HOST;
use crate::runner::CommandRunner;
use crate::traits::{RiskLevel, Tool, ToolSpec, optional_string, optional_u64, require_string};
use async_trait::async_trait;
use std::sync::Arc;

const DEFAULT_LOG_LINES: u64 = 20;
const MAX_LOG_LINES: u64 = 500;

fn target_host(arguments: &serde_json::Value) -> Result<String> {
    Ok(optional_string(arguments, "target_host")?
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| LOCAL_HOST.to_string()))
}

/// Runs an arbitrary shell command on a host.
///
/// High risk: callers must pass the command through the approval gate first.
pub struct TerminalCommandTool {
    runner: Arc<dyn CommandRunner>,
}

impl TerminalCommandTool {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for TerminalCommandTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "execute_terminal_command".to_string(),
            description: "Run a shell command on a monitored host and return its output."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run"},
                    "target_host": {"type": "string", "description": "Host name from the hosts file, default 'local'"}
                },
                "required": ["command"]
            }),
            risk_level: RiskLevel::High,
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let command = require_string(&arguments, "command")?;
        if command.trim().is_empty() {
            return Err(ToolError::InvalidArguments("command must not be empty".to_string()));
        }
        let host = target_host(&arguments)?;
        let result = self.runner.run(command.trim(), &host).await;
        Ok(serde_json::json!({
            "host": host,
            "command": command.trim(),
            "ok": result.is_ok(),
            "output": crate::runner::outcome_text(&result),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    JournalErrors,
    JournalAll,
    Auth,
    Syslog,
    Dmesg,
}

impl LogSource {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "journal_errors" | "errors" => Some(Self::JournalErrors),
            "journal_all" | "journal" => Some(Self::JournalAll),
            "auth" => Some(Self::Auth),
            "syslog" => Some(Self::Syslog),
            "dmesg" | "kernel" => Some(Self::Dmesg),
            _ => None,
        }
    }

    pub fn command(self, lines: u64) -> String {
        match self {
            Self::JournalErrors => format!("journalctl -p 3 -n {lines} --no-pager"),
            Self::JournalAll => format!("journalctl -n {lines} --no-pager"),
            Self::Auth => format!("tail -n {lines} /var/log/auth.log"),
            Self::Syslog => format!("tail -n {lines} /var/log/syslog"),
            Self::Dmesg => format!("dmesg | tail -n {lines}"),
        }
    }
}

/// Read-only log access; the command is fixed by the source, never model-supplied.
pub struct SystemLogsTool {
    runner: Arc<dyn CommandRunner>,
}

impl SystemLogsTool {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for SystemLogsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_system_logs".to_string(),
            description: "Read recent system logs from a host.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "log_source": {
                        "type": "string",
                        "enum": ["journal_errors", "journal_all", "auth", "syslog", "dmesg"]
                    },
                    "lines": {"type": "integer", "description": "How many lines, default 20"},
                    "target_host": {"type": "string"}
                },
                "required": ["log_source"]
            }),
            risk_level: RiskLevel::Low,
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let raw = require_string(&arguments, "log_source")?;
        let source = LogSource::parse(&raw)
            .ok_or_else(|| ToolError::InvalidArguments(format!("unknown log_source {raw:?}")))?;
        let lines = optional_u64(&arguments, "lines")?
            .unwrap_or(DEFAULT_LOG_LINES)
            .clamp(1, MAX_LOG_LINES);
        let host = target_host(&arguments)?;
        let result = self.runner.run(&source.command(lines), &host).await;
        Ok(serde_json::json!({
            "host": host,
            "log_source": raw.trim(),
            "ok": result.is_ok(),
            "output": crate::runner::outcome_text(&result),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(
            &self,
            command: &str,
            host: &str,
        ) -> std::result::Result<String, ExecutionError> {
            self.calls
                .lock()
                .expect("lock")
                .push((command.to_string(), host.to_string()));
            if host == "ghost" {
                return Err(ExecutionError::HostNotFound(host.to_string()));
            }
            Ok("ok".to_string())
        }
    }

    #[tokio::test]
    async fn logs_tool_clamps_lines_and_defaults_host() {
        let rec = Arc::new(Recorder::default());
        let tool = SystemLogsTool::new(rec.clone());
        tool.execute(serde_json::json!({"log_source": "journal_errors", "lines": 9000}))
            .await
            .expect("logs");
        let calls = rec.calls.lock().expect("lock").clone();
        assert_eq!(
            calls,
            vec![(
                "journalctl -p 3 -n 500 --no-pager".to_string(),
                "local".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn logs_tool_rejects_unknown_source() {
        let tool = SystemLogsTool::new(Arc::new(Recorder::default()));
        let err = tool
            .execute(serde_json::json!({"log_source": "/etc/shadow"}))
            .await
            .expect_err("unknown source");
        assert!(err.to_string().contains("unknown log_source"));
    }

    #[tokio::test]
    async fn terminal_tool_reports_failures_as_output() {
        let tool = TerminalCommandTool::new(Arc::new(Recorder::default()));
        assert_eq!(tool.spec().risk_level, RiskLevel::High);
        let out = tool
            .execute(serde_json::json!({"command": "uptime", "target_host": "ghost"}))
            .await
            .expect("runner errors are data");
        assert_eq!(out["ok"], false);
        assert_eq!(out["output"], "Error: Host 'ghost' not found in configuration.");
    }
}
