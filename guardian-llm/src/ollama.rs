use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatOptions, ChatResponse, Role, ToolCall, ToolDefinition, Usage};
use serde::{Deserialize, Serialize};

const OLLAMA_DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, base_url: Option<&str>, model: &str) -> Self {
        let base = base_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(OLLAMA_DEFAULT_BASE_URL)
            .trim_end_matches('/');
        Self {
            http,
            url: format!("{base}/api/chat"),
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(url = %self.url))]
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        let req = OllamaChatRequest::new(&self.model, messages, tools, options);

        let response = self.http.post(&self.url).json(&req).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "ollama chat status={status} body={body}"
            )));
        }

        let parsed: OllamaChatResponse = serde_json::from_str(&body)?;
        parsed.try_into()
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

impl OllamaChatRequest {
    fn new(
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Self {
        Self {
            model: model.to_string(),
            messages: messages.iter().map(to_ollama_message).collect(),
            stream: false,
            options: OllamaOptions {
                temperature: options.temperature,
            },
            format: options.json_mode.then(|| "json".to_string()),
            tools: tools.iter().map(to_ollama_tool).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    r#type: String,
    function: OllamaToolFunction,
}

#[derive(Debug, Serialize)]
struct OllamaToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_ollama_tool(t: &ToolDefinition) -> OllamaTool {
    OllamaTool {
        r#type: "function".to_string(),
        function: OllamaToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaToolCallFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCallFunction {
    name: String,
    /// Ollama sends arguments as a JSON object, not a string.
    #[serde(default)]
    arguments: serde_json::Value,
}

fn to_ollama_message(m: &ChatMessage) -> OllamaMessage {
    OllamaMessage {
        role: m.role.as_str().to_string(),
        content: m.content.clone(),
        tool_calls: m
            .tool_calls
            .iter()
            .map(|tc| OllamaToolCall {
                function: OllamaToolCallFunction {
                    name: tc.name.clone(),
                    arguments: serde_json::from_str(&tc.arguments)
                        .unwrap_or_else(|_| serde_json::json!({})),
                },
            })
            .collect(),
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

impl TryFrom<OllamaChatResponse> for ChatResponse {
    type Error = LlmError;

    fn try_from(v: OllamaChatResponse) -> Result<Self> {
        let message = v
            .message
            .ok_or_else(|| LlmError::ResponseFormat("ollama response missing message".to_string()))?;

        let mut tool_calls = Vec::with_capacity(message.tool_calls.len());
        for (idx, tc) in message.tool_calls.into_iter().enumerate() {
            let arguments = match tc.function.arguments {
                serde_json::Value::Null => "{}".to_string(),
                serde_json::Value::String(s) => s,
                other => serde_json::to_string(&other)?,
            };
            tool_calls.push(ToolCall {
                id: format!("call_{idx}"),
                name: tc.function.name,
                arguments,
            });
        }

        Ok(ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content: message.content,
                tool_calls,
                tool_call_id: None,
            },
            usage: Usage {
                prompt_tokens: v.prompt_eval_count.unwrap_or(0),
                completion_tokens: v.eval_count.unwrap_or(0),
            },
            finish_reason: v.done_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_json_format_and_temperature() {
        let req = OllamaChatRequest::new(
            "llama3",
            &[ChatMessage::system("sys"), ChatMessage::user("hi")],
            &[],
            &ChatOptions {
                temperature: 0.0,
                json_mode: true,
            },
        );
        let v = serde_json::to_value(&req).expect("serialize request");
        assert_eq!(v["format"], "json");
        assert_eq!(v["stream"], false);
        assert_eq!(v["options"]["temperature"], 0.0);
        assert_eq!(v["messages"][0]["role"], "system");
        assert!(v.get("tools").is_none());
    }

    #[test]
    fn tool_calls_get_synthetic_ids_and_string_arguments() {
        let parsed: OllamaChatResponse = serde_json::from_str(
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"get_system_metrics","arguments":{"target_host":"local"}}}]},"done_reason":"stop","prompt_eval_count":12,"eval_count":3}"#,
        )
        .expect("parse response");
        let resp = ChatResponse::try_from(parsed).expect("convert response");
        assert_eq!(resp.message.tool_calls.len(), 1);
        assert_eq!(resp.message.tool_calls[0].id, "call_0");
        let args: serde_json::Value =
            serde_json::from_str(&resp.message.tool_calls[0].arguments).expect("arguments json");
        assert_eq!(args["target_host"], "local");
        assert_eq!(resp.usage.completion_tokens, 3);
    }

    #[test]
    fn missing_message_is_a_format_error() {
        let parsed: OllamaChatResponse =
            serde_json::from_str(r#"{"done":true}"#).expect("parse response");
        assert!(ChatResponse::try_from(parsed).is_err());
    }
}
