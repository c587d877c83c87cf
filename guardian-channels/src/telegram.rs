use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, InboundMessageKind, MessageFormat, MessageId, OutboundMessage};
use anyhow::Result;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message","callback_query"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        Self::with_api_base(bot_token, TELEGRAM_API_BASE)
    }

    pub fn with_api_base(bot_token: &str, api_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base, self.bot_token, method
        ))?)
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> std::result::Result<T, CallError> {
        let url = self.api_url(method).map_err(CallError::Other)?;
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CallError::Other(e.into()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CallError::Rejected { status, body: text });
        }
        let parsed: TelegramResponse<T> =
            resp.json().await.map_err(|e| CallError::Other(e.into()))?;
        parsed
            .result
            .ok_or_else(|| CallError::Other(anyhow::anyhow!("telegram {method}: empty result")))
    }
}

#[derive(Debug)]
enum CallError {
    Rejected { status: StatusCode, body: String },
    Other(anyhow::Error),
}

impl From<CallError> for anyhow::Error {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Rejected { status, body } => {
                anyhow::anyhow!("telegram request rejected: status={status} body={body}")
            }
            CallError::Other(e) => e,
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, message), fields(choices = message.choices.len()))]
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId> {
        let mut rejected = None;
        for &format in encoders(message.format) {
            let body = send_message_body(recipient_id, &message, format);
            match self.call::<TelegramMessage>("sendMessage", &body).await {
                Ok(sent) => {
                    return sent
                        .message_id
                        .map(|id| MessageId::new(id.to_string()))
                        .ok_or_else(|| {
                            anyhow::anyhow!("telegram sendMessage returned no message_id")
                        });
                }
                // Unbalanced markdown (underscores in process names, stray '*') is a 400.
                Err(CallError::Rejected { status, body }) if status == StatusCode::BAD_REQUEST => {
                    tracing::debug!(?format, %body, "telegram rejected encoding; trying next");
                    rejected = Some(CallError::Rejected { status, body });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(rejected
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow::anyhow!("telegram sendMessage: no encoding accepted")))
    }

    async fn edit(&self, recipient_id: &str, message_id: &MessageId, content: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": recipient_id,
            "message_id": message_id.as_str().parse::<i64>()?,
            "text": content,
        });
        let _: serde_json::Value = self.call("editMessageText", &body).await?;
        Ok(())
    }

    async fn acknowledge_choice(&self, callback_token: &str) -> Result<()> {
        let body = serde_json::json!({ "callback_query_id": callback_token });
        let _: serde_json::Value = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }

    async fn send_typing(&self, recipient_id: &str) -> Result<()> {
        let body = serde_json::json!({ "chat_id": recipient_id, "action": "typing" });
        let _: serde_json::Value = self.call("sendChatAction", &body).await?;
        Ok(())
    }
}

/// Encodings tried in order until Telegram accepts one.
fn encoders(preferred: MessageFormat) -> &'static [MessageFormat] {
    match preferred {
        MessageFormat::Markdown => &[MessageFormat::Markdown, MessageFormat::Plain],
        MessageFormat::Plain => &[MessageFormat::Plain],
    }
}

fn send_message_body(
    recipient_id: &str,
    message: &OutboundMessage,
    format: MessageFormat,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "chat_id": recipient_id,
        "text": message.content,
    });
    if format == MessageFormat::Markdown {
        body["parse_mode"] = "Markdown".into();
    }
    if let Some(reply_to) = message
        .reply_to_message_id
        .as_ref()
        .and_then(|id| id.as_str().parse::<i64>().ok())
    {
        body["reply_to_message_id"] = reply_to.into();
    }
    if !message.choices.is_empty() {
        let row: Vec<serde_json::Value> = message
            .choices
            .iter()
            .map(|c| serde_json::json!({ "text": c.label, "callback_data": c.id }))
            .collect();
        body["reply_markup"] = serde_json::json!({ "inline_keyboard": [row] });
    }
    body
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response
                .json::<TelegramResponse<Vec<TelegramUpdate>>>()
                .await
            {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(inbound) = build_inbound(&update) {
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_inbound(update: &TelegramUpdate) -> Option<InboundMessage> {
    if let Some(query) = update.callback_query.as_ref() {
        return build_callback_inbound(update.update_id, query);
    }
    build_message_inbound(update.update_id, update.message.as_ref()?)
}

fn build_message_inbound(update_id: i64, message: &TelegramMessage) -> Option<InboundMessage> {
    let chat = message.chat.as_ref()?;
    let text = message.text.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
    let (kind, content) = match normalize_command(text) {
        Some(cmd) => (InboundMessageKind::Command, cmd),
        None => (InboundMessageKind::Message, text.to_string()),
    };
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));

    Some(InboundMessage {
        kind,
        message_id: message_id.into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        sender_id: sender_id.into(),
        thread_id: Some(chat.id.to_string().into()),
        is_group: chat.r#type != "private",
        content,
        callback_token: None,
        received_at: Utc::now(),
    })
}

fn build_callback_inbound(update_id: i64, query: &TelegramCallbackQuery) -> Option<InboundMessage> {
    let data = query.data.as_deref().map(str::trim).filter(|d| !d.is_empty())?;
    let message = query.message.as_ref();
    let chat = message.and_then(|m| m.chat.as_ref())?;
    let message_id = message
        .and_then(|m| m.message_id)
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:callback"));

    Some(InboundMessage {
        kind: InboundMessageKind::Callback,
        message_id: message_id.into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        sender_id: query.from.id.to_string().into(),
        thread_id: Some(chat.id.to_string().into()),
        is_group: chat.r#type != "private",
        content: data.to_string(),
        callback_token: Some(query.id.clone()),
        received_at: Utc::now(),
    })
}

/// `/status@guardian_bot extra` becomes `/status`.
fn normalize_command(text: &str) -> Option<String> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') || first.len() < 2 {
        return None;
    }
    let bare = first.split('@').next().unwrap_or(first);
    Some(bare.to_ascii_lowercase())
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize, Serialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}
