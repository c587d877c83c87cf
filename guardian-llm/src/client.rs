use crate::error::{LlmError, Result};
use crate::ollama::OllamaClient;
use crate::openai;
use crate::types::{ChatMessage, ChatOptions, ChatResponse, ToolDefinition};
use std::time::Duration;

const TOOL_NAME_MAX_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenAI,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::OpenAI => "openai",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub model: String,
    /// Ollama daemon URL; hosted OpenAI always uses its public endpoint.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    settings: LlmSettings,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(settings: LlmSettings) -> Result<Self> {
        if settings.model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model must not be empty".to_string()));
        }
        let provider = detect_provider(&settings.model);
        if provider != Provider::Ollama
            && settings
                .api_key
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            return Err(LlmError::InvalidInput(format!(
                "{} model {:?} requires an api key",
                provider.as_str(),
                settings.model
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            provider,
            settings,
            client,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = self.provider.as_str()))]
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        let api_key = self.settings.api_key.as_deref().unwrap_or_default();
        match self.provider {
            Provider::Ollama => {
                let c = OllamaClient::new(
                    self.client.clone(),
                    self.settings.base_url.as_deref(),
                    &self.settings.model,
                );
                c.chat(messages, tools, options).await
            }
            Provider::OpenAI => {
                openai::chat(
                    &self.client,
                    api_key,
                    &self.settings.model,
                    messages,
                    tools,
                    options,
                )
                .await
            }
        }
    }
}

/// Ollama tags (`name:size`) always stay local, so `gpt-oss:20b` is not OpenAI.
fn detect_provider(model: &str) -> Provider {
    let m = model.trim().to_ascii_lowercase();
    if m.contains(':') {
        return Provider::Ollama;
    }
    if m.starts_with("gpt-") || ["o1", "o3", "o4"].iter().any(|p| m.starts_with(p)) {
        return Provider::OpenAI;
    }
    Provider::Ollama
}

/// Tool names are sent verbatim, so they must already match
/// `^[a-zA-Z0-9_-]{1,64}$`.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > TOOL_NAME_MAX_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} must be 1..={TOOL_NAME_MAX_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(model: &str, api_key: Option<&str>) -> LlmSettings {
        LlmSettings {
            model: model.to_string(),
            base_url: None,
            api_key: api_key.map(str::to_string),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn provider_is_detected_from_model_id() {
        assert_eq!(detect_provider("gpt-4o-mini"), Provider::OpenAI);
        assert_eq!(detect_provider("o3-mini"), Provider::OpenAI);
        assert_eq!(detect_provider("llama3"), Provider::Ollama);
        assert_eq!(detect_provider("qwen2.5:7b"), Provider::Ollama);
        assert_eq!(detect_provider("claude-sonnet-4"), Provider::Ollama);
    }

    #[test]
    fn tagged_models_stay_on_ollama() {
        assert_eq!(detect_provider("gpt-oss:20b"), Provider::Ollama);
        assert_eq!(detect_provider(" GPT-OSS:120B "), Provider::Ollama);
    }

    #[test]
    fn openai_requires_api_key() {
        let err = LlmClient::new(settings("gpt-4o", Some("  ")))
            .err()
            .expect("blank key should be rejected");
        assert!(err.to_string().contains("requires an api key"));

        let client = LlmClient::new(settings("gpt-4o", Some("sk-o"))).expect("key present");
        assert_eq!(client.provider(), Provider::OpenAI);

        let client = LlmClient::new(settings("llama3", None)).expect("ollama needs no key");
        assert_eq!(client.provider(), Provider::Ollama);
        assert_eq!(client.model(), "llama3");
    }

    #[test]
    fn tool_name_validation_rejects_dots_and_empty() {
        assert!(validate_tool_name("get_system_metrics").is_ok());
        assert!(validate_tool_name("run-command").is_ok());
        assert!(validate_tool_name("shell.execute").is_err());
        assert!(validate_tool_name("").is_err());
        assert!(validate_tool_name(&"x".repeat(65)).is_err());
    }
}
