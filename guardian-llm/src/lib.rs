//! BYO-key chat client for the Guardian reasoning collaborator.
//!
//! Pure HTTP client. Talks to a local Ollama daemon by default and to hosted
//! OpenAI when the configured model id names an OpenAI model.

mod client;
mod error;
mod ollama;
mod openai;
mod types;

pub use client::{LlmClient, LlmSettings, Provider, validate_tool_name};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatOptions, ChatResponse, Role, ToolCall, ToolDefinition, Usage};
