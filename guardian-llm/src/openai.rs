//! Hosted OpenAI chat completions, for model ids that name an OpenAI model.

use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatOptions, ChatResponse, Role, ToolCall, ToolDefinition, Usage};
use serde::Deserialize;
use serde_json::{Value, json};

const OPENAI_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

#[tracing::instrument(level = "info", skip_all, fields(%model))]
pub(crate) async fn chat(
    http: &reqwest::Client,
    api_key: &str,
    model: &str,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    options: &ChatOptions,
) -> Result<ChatResponse> {
    let body = request_body(model, messages, tools, options);
    let response = http
        .post(OPENAI_COMPLETIONS_URL)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(LlmError::Http(format!(
            "openai chat status={status} body={text}"
        )));
    }
    serde_json::from_str::<Completion>(&text)?.into_response()
}

fn request_body(
    model: &str,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    options: &ChatOptions,
) -> Value {
    let messages: Vec<Value> = messages.iter().map(message_json).collect();
    let mut body = json!({
        "model": model,
        "messages": messages,
        "temperature": options.temperature,
    });
    if !tools.is_empty() {
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();
        body["tools"] = tools.into();
        body["tool_choice"] = "auto".into();
    }
    if options.json_mode {
        body["response_format"] = json!({ "type": "json_object" });
    }
    body
}

fn message_json(m: &ChatMessage) -> Value {
    let mut v = json!({ "role": m.role.as_str() });
    // Assistant turns that only call tools carry a null content.
    v["content"] = if m.content.is_empty() && !m.tool_calls.is_empty() {
        Value::Null
    } else {
        m.content.clone().into()
    };
    if !m.tool_calls.is_empty() {
        let calls: Vec<Value> = m
            .tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": { "name": tc.name, "arguments": tc.arguments },
                })
            })
            .collect();
        v["tool_calls"] = calls.into();
    }
    if let Some(id) = m.tool_call_id.as_deref() {
        v["tool_call_id"] = id.into();
    }
    v
}

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl Completion {
    fn into_response(self) -> Result<ChatResponse> {
        let choice = self.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("openai reply has no choices".to_string())
        })?;
        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();
        Ok(ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content: choice.message.content.unwrap_or_default(),
                tool_calls,
                tool_call_id: None,
            },
            usage: self.usage,
            finish_reason: choice
                .finish_reason
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnose_options() -> ChatOptions {
        ChatOptions {
            temperature: 0.0,
            json_mode: true,
        }
    }

    #[test]
    fn diagnose_request_asks_for_a_json_object_without_tools() {
        let body = request_body(
            "gpt-4o-mini",
            &[
                ChatMessage::system("You are a Linux SysAdmin."),
                ChatMessage::user("Metrics: {}"),
            ],
            &[],
            &diagnose_options(),
        );
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["temperature"], 0.0);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn chat_request_carries_tools_and_tool_turns() {
        let tool = ToolDefinition {
            name: "get_system_metrics".to_string(),
            description: "current metrics".to_string(),
            parameters: json!({ "type": "object" }),
        };
        let call = ChatMessage {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "get_system_metrics".to_string(),
                arguments: "{}".to_string(),
            }],
            tool_call_id: None,
        };
        let result = ChatMessage::tool_result("call_1", "{\"cpu\":12.5}");
        let body = request_body("gpt-4o", &[call, result], &[tool], &ChatOptions::default());

        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "get_system_metrics");
        assert!(body["messages"][0]["content"].is_null());
        assert_eq!(body["messages"][0]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(body["messages"][1]["tool_call_id"], "call_1");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn reply_with_tool_call_is_decoded() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "call_9", "type": "function",
                        "function": {"name": "run_command", "arguments": "{\"command\":\"df -h\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 14}
        }"#;
        let resp = serde_json::from_str::<Completion>(raw)
            .expect("parse reply")
            .into_response()
            .expect("one choice");
        assert_eq!(resp.message.content, "");
        assert_eq!(resp.message.tool_calls[0].name, "run_command");
        assert_eq!(resp.usage.prompt_tokens, 120);
        assert_eq!(resp.finish_reason, "tool_calls");
    }

    #[test]
    fn reply_without_choices_is_malformed() {
        let err = serde_json::from_str::<Completion>(r#"{"choices":[]}"#)
            .expect("parse reply")
            .into_response()
            .expect_err("no choices");
        assert!(err.is_malformed_reply());
    }
}
