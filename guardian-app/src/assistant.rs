//! Conversational front-end: LLM + host tools, aware of the review in progress.

use crate::context::GuardianContext;
use crate::session::Session;
use anyhow::Result;
use guardian_llm::{ChatMessage, ChatOptions, LlmClient, ToolCall, ToolDefinition};
use guardian_tools::{HostRegistry, KnowledgeStore, Tool, to_llm_tool_def};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

const TOOL_LOOPS_MAX: usize = 4;

pub struct Assistant {
    llm: LlmClient,
    temperature: f32,
    tools: Vec<Arc<dyn Tool>>,
    ctx: Arc<GuardianContext>,
    hosts: Arc<HostRegistry>,
    knowledge: KnowledgeStore,
}

impl Assistant {
    pub fn new(
        llm: LlmClient,
        temperature: f32,
        tools: Vec<Arc<dyn Tool>>,
        ctx: Arc<GuardianContext>,
        hosts: Arc<HostRegistry>,
        knowledge: KnowledgeStore,
    ) -> Self {
        Self {
            llm,
            temperature,
            tools,
            ctx,
            hosts,
            knowledge,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session.id))]
    pub async fn run(&self, session: &mut Session, user_message: &str) -> Result<String> {
        tracing::info!(
            model = %self.llm.model(),
            prior_history_messages = session.history.len(),
            tools_registered = self.tools.len(),
            "assistant run started"
        );
        session.history.push(ChatMessage::user(user_message));
        session.last_active = chrono::Utc::now();

        let tool_defs: Vec<ToolDefinition> = self
            .tools
            .iter()
            .map(|t| to_llm_tool_def(t.as_ref()))
            .collect();
        let options = ChatOptions {
            temperature: self.temperature,
            json_mode: false,
        };

        for tool_loop in 1..=TOOL_LOOPS_MAX {
            let mut messages = vec![ChatMessage::system(self.system_prompt().await)];
            messages.extend(session.history.iter().cloned());

            let llm_started = Instant::now();
            let response = self.llm.chat(&messages, &tool_defs, &options).await?;
            tracing::info!(
                tool_loop,
                latency_ms = llm_started.elapsed().as_millis() as u64,
                prompt_tokens = response.usage.prompt_tokens,
                completion_tokens = response.usage.completion_tokens,
                tool_calls = response.message.tool_calls.len(),
                "assistant llm call completed"
            );
            session.usage_totals.prompt_tokens += response.usage.prompt_tokens;
            session.usage_totals.completion_tokens += response.usage.completion_tokens;

            if response.message.tool_calls.is_empty() {
                let content = response.message.content.clone();
                session.history.push(ChatMessage::assistant(content.clone()));
                session.trim_history();
                return Ok(content);
            }

            session.history.push(response.message.clone());
            for call in &response.message.tool_calls {
                let output = self.dispatch(call).await;
                session
                    .history
                    .push(ChatMessage::tool_result(call.id.clone(), output.to_string()));
            }
        }

        tracing::error!(tool_loops_max = TOOL_LOOPS_MAX, "assistant tool loop limit reached");
        session.trim_history();
        Ok("Tool loop limit reached.".to_string())
    }

    /// Run one tool call. Failures are returned to the model as `{"error": ...}`.
    async fn dispatch(&self, call: &ToolCall) -> serde_json::Value {
        let Some(tool) = self.tools.iter().find(|t| t.spec().name == call.name) else {
            tracing::error!(tool_name = %call.name, "tool call referenced unknown tool");
            return json!({ "error": format!("unknown tool {}", call.name) });
        };
        let args: serde_json::Value = match serde_json::from_str(&call.arguments) {
            Ok(v) => v,
            Err(e) => return json!({ "error": format!("invalid tool arguments: {e}") }),
        };

        let started = Instant::now();
        let out = tool.execute(args).await;
        tracing::info!(
            tool_call_id = %call.id,
            tool_name = %call.name,
            ok = out.is_ok(),
            latency_ms = started.elapsed().as_millis() as u64,
            "tool call executed"
        );
        out.unwrap_or_else(|e| json!({ "error": e.to_string() }))
    }

    async fn system_prompt(&self) -> String {
        let knowledge = match self.knowledge.load().await {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(error = %e, "could not read knowledge file");
                String::new()
            }
        };
        build_system_prompt(&self.hosts, &knowledge, self.ctx.as_ref())
    }
}

fn build_system_prompt(hosts: &HostRegistry, knowledge: &str, ctx: &GuardianContext) -> String {
    let host_lines: Vec<String> = hosts
        .listing()
        .iter()
        .map(|h| format!("- {}", h.summary_line()))
        .collect();

    let mut prompt = format!(
        "You are Guardian, an expert Linux system administrator helping the operator monitor and repair servers.\n\n\
         AVAILABLE HOSTS:\n{}\n\n\
         Always pass `target_host` to host tools; use 'local' when the operator does not name one.\n\
         Tools: get_system_metrics for health, read_system_logs for errors, execute_terminal_command for commands, \
         web_search for unknown errors, save_knowledge when the operator teaches you something.\n\
         Never run destructive commands (rm, kill, restart) without asking first. For complex tasks, propose a \
         step-by-step plan with real commands and ask before running the first step.\n\
         Be concise. If the operator only greets you, answer without tools.",
        host_lines.join("\n")
    );

    if !knowledge.trim().is_empty() {
        prompt.push_str("\n\nKNOWN FACTS:\n");
        prompt.push_str(knowledge.trim());
    }
    if let Some(review) = ctx.current_review() {
        prompt.push_str(&format!(
            "\n\nCURRENTLY UNDER REVIEW:\nDiagnosis: {}\nProposed action: {}",
            review.diagnosis, review.action
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalBroker;
    use guardian_tools::HostDescriptor;

    #[test]
    fn prompt_lists_hosts_knowledge_and_review() {
        let ctx = GuardianContext::new(Arc::new(ApprovalBroker::new()));
        ctx.set_review("nginx is down", "systemctl restart nginx");
        let hosts = HostRegistry::parse(
            r#"{"hosts":[{"name":"web-01","type":"ssh","ip":"10.0.0.5","user":"ops","description":"frontend"}]}"#,
        )
        .expect("hosts");
        let prompt = build_system_prompt(&hosts, "- **nginx**: lives on web-01", &ctx);

        assert!(prompt.contains(&format!("- {}", HostDescriptor::local().summary_line())));
        assert!(prompt.contains("web-01"));
        assert!(prompt.contains("KNOWN FACTS:\n- **nginx**: lives on web-01"));
        assert!(prompt.ends_with("Proposed action: systemctl restart nginx"));
    }

    #[test]
    fn prompt_omits_empty_sections() {
        let ctx = GuardianContext::new(Arc::new(ApprovalBroker::new()));
        let prompt = build_system_prompt(&HostRegistry::empty(), "  ", &ctx);
        assert!(!prompt.contains("KNOWN FACTS"));
        assert!(!prompt.contains("UNDER REVIEW"));
    }
}
