//! Reasoning collaborator seam: turns metrics, anomalies and history into a
//! diagnosis plus one proposed command.

use crate::metrics::{Anomaly, MetricsSnapshot};
use async_trait::async_trait;
use guardian_llm::{ChatMessage, ChatOptions, LlmClient};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sentinel proposal that ends a cycle.
pub const FINISH: &str = "FINISH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Investigate,
    Fix,
    Finish,
    /// Nothing to do; only produced locally for healthy cycles.
    None,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Investigate => "investigate",
            Self::Fix => "fix",
            Self::Finish => "finish",
            Self::None => "none",
        }
    }

    /// The three values a collaborator may send.
    fn from_reply(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "investigate" => Some(Self::Investigate),
            "fix" => Some(Self::Fix),
            "finish" => Some(Self::Finish),
            _ => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Proposal {
    pub diagnosis: String,
    pub proposed_action: String,
    pub action_type: ActionType,
}

impl Proposal {
    pub fn healthy() -> Self {
        Self {
            diagnosis: "System Healthy".to_string(),
            proposed_action: String::new(),
            action_type: ActionType::None,
        }
    }

    /// Terminal proposal carrying the collaborator failure.
    pub fn degraded(err: &DiagnosisError) -> Self {
        Self {
            diagnosis: format!("Error in diagnosis: {err}"),
            proposed_action: FINISH.to_string(),
            action_type: ActionType::Finish,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiagnosisError {
    #[error("reasoning collaborator unavailable: {0}")]
    Transport(String),

    #[error("malformed reply: {0}")]
    Malformed(String),
}

pub struct DiagnosisRequest<'a> {
    pub metrics: &'a MetricsSnapshot,
    pub anomalies: &'a [Anomaly],
    pub history: &'a [String],
}

#[async_trait]
pub trait Diagnoser: Send + Sync {
    async fn diagnose(&self, req: DiagnosisRequest<'_>) -> Result<Proposal, DiagnosisError>;
}

const SYSTEM_PROMPT: &str = r#"You are a Linux SysAdmin. Analyze the system metrics and anomalies.
You have permissions to execute standard Linux commands.

GOAL:
1. If you need more info to identify the root cause, propose a SAFE command (e.g. cat logs, ps aux). Set "action_type" to "investigate".
2. If you have identified the root cause and know the fix, propose an ACTION command (e.g. systemctl restart <service>, rm <file>, kill <pid>). Set "action_type" to "fix".
3. If the system is healthy or you cannot do anything more, set "proposed_action" to "FINISH" and "action_type" to "finish".

CRITICAL RULES:
- The diagnosis must be specific: name the process and PID, e.g. "Process 'rustdesk' (PID 1234) is using 80% CPU".
- A process name is not a service name. If unsure, investigate first with 'systemctl status <name>' or 'ps -fp <pid>'.
- For a user process propose 'kill -15 <pid>', formatted as `kill <pid> (<process_name>)`, e.g. `kill 1234 (python)`.
- Only propose 'systemctl restart' when you are sure it is a service.
- Never use placeholders like 'restart/stop/start'.
- If a previous command failed, do not retry it.

Available actions:
- File system: mkdir, rm, ls, touch, cat, grep, head, tail
- Packages: apt update, apt upgrade, apt install
- System: systemctl restart|stop|status <name>, reboot
- Process: kill -15 <pid>, kill -9 <pid>
- Network: ip, ping
- Web search: search "query" (e.g. search "nginx failed to bind port 80")

Propose a SINGLE command.
Return ONLY JSON: {"diagnosis": "...", "proposed_action": "...", "action_type": "investigate|fix|finish"}"#;

pub struct LlmDiagnoser {
    llm: LlmClient,
    temperature: f32,
    knowledge: String,
}

impl LlmDiagnoser {
    /// `knowledge` is the note file contents, read once at construction.
    pub fn new(llm: LlmClient, temperature: f32, knowledge: String) -> Self {
        Self {
            llm,
            temperature,
            knowledge,
        }
    }

    fn system_prompt(&self, history: &[String]) -> String {
        let mut prompt = SYSTEM_PROMPT.to_string();
        if !self.knowledge.trim().is_empty() {
            prompt.push_str("\n\nKnown facts about these servers:\n");
            prompt.push_str(self.knowledge.trim());
        }
        prompt.push_str("\n\nHISTORY OF INVESTIGATION:\n");
        if history.is_empty() {
            prompt.push_str("None");
        } else {
            prompt.push_str(&history.join("\n"));
        }
        prompt
    }
}

fn user_prompt(req: &DiagnosisRequest<'_>) -> String {
    let metrics = serde_json::to_string(req.metrics).unwrap_or_else(|_| "{}".to_string());
    let anomalies: Vec<String> = req.anomalies.iter().map(ToString::to_string).collect();
    let anomalies = serde_json::to_string(&anomalies).unwrap_or_else(|_| "[]".to_string());
    format!("Metrics: {metrics}\nAnomalies: {anomalies}\n\nProvide response in JSON format.")
}

#[async_trait]
impl Diagnoser for LlmDiagnoser {
    #[tracing::instrument(level = "info", skip_all, fields(model = self.llm.model(), history = req.history.len()))]
    async fn diagnose(&self, req: DiagnosisRequest<'_>) -> Result<Proposal, DiagnosisError> {
        let messages = [
            ChatMessage::system(self.system_prompt(req.history)),
            ChatMessage::user(user_prompt(&req)),
        ];
        let options = ChatOptions {
            temperature: self.temperature,
            json_mode: true,
        };
        let resp = self
            .llm
            .chat(&messages, &[], &options)
            .await
            .map_err(|e| {
                if e.is_malformed_reply() {
                    DiagnosisError::Malformed(e.to_string())
                } else {
                    DiagnosisError::Transport(e.to_string())
                }
            })?;
        parse_proposal(&resp.message.content)
    }
}

/// Validate a collaborator reply: the outermost `{...}` must hold string
/// `diagnosis`, `proposed_action` and a known `action_type`.
pub fn parse_proposal(raw: &str) -> Result<Proposal, DiagnosisError> {
    let start = raw
        .find('{')
        .ok_or_else(|| DiagnosisError::Malformed("no JSON object in reply".to_string()))?;
    let end = raw
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| DiagnosisError::Malformed("unterminated JSON object".to_string()))?;

    let value: serde_json::Value = serde_json::from_str(&raw[start..=end])
        .map_err(|e| DiagnosisError::Malformed(e.to_string()))?;

    let field = |name: &str| -> Result<String, DiagnosisError> {
        value
            .get(name)
            .and_then(serde_json::Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| DiagnosisError::Malformed(format!("missing string field {name:?}")))
    };

    let diagnosis = field("diagnosis")?;
    let proposed_action = field("proposed_action")?;
    let raw_type = field("action_type")?;
    let action_type = ActionType::from_reply(&raw_type)
        .ok_or_else(|| DiagnosisError::Malformed(format!("unknown action_type {raw_type:?}")))?;

    Ok(Proposal {
        diagnosis,
        proposed_action,
        action_type,
    })
}
