use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    /// Rejected before any request went out.
    #[error("invalid llm request: {0}")]
    InvalidInput(String),

    /// Provider unreachable, timed out, or answered with a non-2xx status.
    #[error("llm transport: {0}")]
    Http(String),

    /// 2xx answer whose body does not match the provider schema.
    #[error("llm reply not understood: {0}")]
    ResponseFormat(String),
}

impl LlmError {
    /// The provider answered, but with something unusable.
    pub fn is_malformed_reply(&self) -> bool {
        matches!(self, Self::ResponseFormat(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Http(format!("request timed out: {e}"))
        } else if e.is_connect() {
            Self::Http(format!("provider unreachable: {e}"))
        } else if e.is_decode() {
            Self::ResponseFormat(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
