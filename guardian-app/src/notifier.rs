//! Outbound messages to the configured operator chat.

use crate::approval::{APPROVE_PREFIX, ApprovalChannel, DENY_PREFIX};
use async_trait::async_trait;
use guardian_channels::{ChannelAdapter, Choice, MessageId, OutboundMessage};
use std::sync::Arc;
use uuid::Uuid;

const MAX_RESULT_CHARS: usize = 4000;

/// Posts to one chat. Without a channel every post is a no-op.
pub struct Notifier {
    channel: Option<Arc<dyn ChannelAdapter>>,
    chat_id: String,
}

impl Notifier {
    pub fn new(channel: Arc<dyn ChannelAdapter>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: Some(channel),
            chat_id: chat_id.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            channel: None,
            chat_id: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub async fn send(&self, message: OutboundMessage) -> anyhow::Result<Option<MessageId>> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(None);
        };
        channel.send(&self.chat_id, message).await.map(Some)
    }

    /// Failures are logged and dropped.
    pub async fn post(&self, text: &str) {
        if let Err(e) = self.send(OutboundMessage::text(text)).await {
            tracing::warn!(error = %e, "notification failed");
        }
    }

    pub async fn post_execution_result(&self, command: &str, output: &str) {
        self.post(&render_execution_result(command, output)).await;
    }
}

#[async_trait]
impl ApprovalChannel for Notifier {
    async fn request_approval(
        &self,
        id: Uuid,
        diagnosis: &str,
        action: &str,
    ) -> anyhow::Result<()> {
        if self.channel.is_none() {
            anyhow::bail!("no operator channel configured");
        }
        let message = OutboundMessage::text(render_approval_request(diagnosis, action))
            .with_choices(vec![
                Choice::new(format!("{APPROVE_PREFIX}{id}"), "✅ Approve"),
                Choice::new(format!("{DENY_PREFIX}{id}"), "❌ Deny"),
            ]);
        self.send(message).await?;
        Ok(())
    }
}

pub fn render_approval_request(diagnosis: &str, action: &str) -> String {
    format!("🚨 *Issue Detected*\n\nDiagnosis: {diagnosis}\n\nProposed Action: `{action}`")
}

pub fn render_execution_result(command: &str, output: &str) -> String {
    let shown = truncate_chars(output, MAX_RESULT_CHARS);
    let suffix = if shown.len() < output.len() {
        "\n...(truncated)"
    } else {
        ""
    };
    format!("💻 *Executed*: `{command}`\n\n📄 *Output*:\n```\n{shown}{suffix}\n```")
}

/// Prefix of `s` with at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
