//! Inbound dispatcher for the operator chat: commands, approval callbacks,
//! trigger keywords, and free-text conversation with the assistant.

use crate::approval::parse_choice;
use crate::assistant::Assistant;
use crate::commands::{self, MANUAL_CHECK_REPLY};
use crate::context::GuardianContext;
use crate::session::SessionManager;
use anyhow::Result;
use guardian_channels::{ChannelAdapter, InboundMessage, InboundMessageKind, OutboundMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    chat_id: String,
    channel: Arc<dyn ChannelAdapter>,
    ctx: Arc<GuardianContext>,
    sessions: Arc<SessionManager>,
    assistant: Option<Arc<Assistant>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
}

impl Gateway {
    pub fn new(
        chat_id: impl Into<String>,
        channel: Arc<dyn ChannelAdapter>,
        ctx: Arc<GuardianContext>,
        sessions: Arc<SessionManager>,
        assistant: Option<Arc<Assistant>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            channel,
            ctx,
            sessions,
            assistant,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                return Ok(());
            };

            if let Err(e) = self.handle_inbound(inbound).await {
                tracing::warn!(%e, "handle_inbound failed");
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(kind = ?inbound.kind, sender_id = %inbound.sender_id))]
    async fn handle_inbound(self: &Arc<Self>, inbound: InboundMessage) -> Result<()> {
        let chat = inbound.thread_id.as_deref().unwrap_or(&inbound.sender_id);
        if chat != self.chat_id {
            tracing::debug!(chat, "ignoring message from unconfigured chat");
            return Ok(());
        }

        match inbound.kind {
            InboundMessageKind::Callback => self.handle_callback(&inbound).await,
            InboundMessageKind::Command => {
                if let Some(reply) = commands::handle_command(&self.ctx, &inbound.content) {
                    self.reply(&inbound, reply).await?;
                }
                Ok(())
            }
            InboundMessageKind::Message => {
                if commands::is_trigger_request(&inbound.content) {
                    self.ctx.request_manual_check();
                    return self.reply(&inbound, MANUAL_CHECK_REPLY.to_string()).await;
                }
                // Conversations can take several LLM round-trips; button
                // presses must not queue behind them.
                let this = Arc::clone(self);
                tokio::spawn(async move { this.converse(inbound).await });
                Ok(())
            }
        }
    }

    async fn handle_callback(&self, inbound: &InboundMessage) -> Result<()> {
        // The broker hands back the action of the escalation being answered,
        // which may be a chat command rather than the loop's current review.
        let resolved = parse_choice(&inbound.content).and_then(|(id, approved)| {
            self.ctx
                .broker()
                .resolve(id, approved)
                .map(|action| (approved, action))
        });

        if let Some(token) = inbound.callback_token.as_deref() {
            if let Err(e) = self.channel.acknowledge_choice(token).await {
                tracing::warn!(error = %e, "failed to acknowledge button press");
            }
        }

        let text = match resolved {
            Some((true, action)) => format!("✅ Action Approved: {action}"),
            Some((false, action)) => format!("❌ Action Denied: {action}"),
            None => {
                tracing::info!(data = %inbound.content, "stale or unknown approval callback");
                "⌛ This approval request has expired.".to_string()
            }
        };
        if let Err(e) = self
            .channel
            .edit(&self.chat_id, &inbound.message_id, &text)
            .await
        {
            tracing::warn!(error = %e, "failed to update approval message");
        }
        Ok(())
    }

    async fn converse(&self, inbound: InboundMessage) {
        let Some(assistant) = self.assistant.as_ref() else {
            let _ = self
                .reply(&inbound, offline_reply("no language model configured"))
                .await;
            return;
        };

        if let Err(e) = self.channel.send_typing(&self.chat_id).await {
            tracing::debug!(error = %e, "typing indicator not sent");
        }

        let channel_id = inbound.channel_id.as_str();
        let sender_id = inbound.sender_id.as_str();
        let mut session = self.sessions.checkout(channel_id, sender_id);
        let response = match assistant.run(&mut session, &inbound.content).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%e, "assistant run failed");
                offline_reply(&e.to_string())
            }
        };
        self.sessions.store(channel_id, sender_id, session);

        if let Err(e) = self.reply(&inbound, response).await {
            tracing::warn!(%e, "failed to deliver assistant reply");
        }
    }

    async fn reply(&self, inbound: &InboundMessage, content: String) -> Result<()> {
        let mut message = OutboundMessage::text(content);
        message.reply_to_message_id = Some(inbound.message_id.clone());
        self.channel.send(&self.chat_id, message).await?;
        Ok(())
    }
}

fn offline_reply(error: &str) -> String {
    format!("😴 My AI brain is offline right now. Error: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalBroker;
    use async_trait::async_trait;
    use guardian_channels::MessageId;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeChat {
        sent: Mutex<Vec<String>>,
        edits: Mutex<Vec<String>>,
        acks: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelAdapter for FakeChat {
        fn channel_id(&self) -> &str {
            "telegram"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
            Ok(())
        }

        async fn send(&self, _recipient_id: &str, message: OutboundMessage) -> Result<MessageId> {
            self.sent.lock().expect("lock").push(message.content);
            Ok(MessageId::new("100"))
        }

        async fn edit(&self, _recipient_id: &str, _message_id: &MessageId, content: &str) -> Result<()> {
            self.edits.lock().expect("lock").push(content.to_string());
            Ok(())
        }

        async fn acknowledge_choice(&self, callback_token: &str) -> Result<()> {
            self.acks.lock().expect("lock").push(callback_token.to_string());
            Ok(())
        }
    }

    fn gateway() -> (Arc<Gateway>, Arc<FakeChat>, Arc<GuardianContext>) {
        let chat = Arc::new(FakeChat::default());
        let ctx = Arc::new(GuardianContext::new(Arc::new(ApprovalBroker::new())));
        let (_tx, rx) = mpsc::channel(8);
        let gw = Arc::new(Gateway::new(
            "42",
            chat.clone(),
            ctx.clone(),
            Arc::new(SessionManager::new()),
            None,
            rx,
        ));
        (gw, chat, ctx)
    }

    fn inbound(kind: InboundMessageKind, chat: &str, content: &str) -> InboundMessage {
        InboundMessage {
            kind,
            message_id: "7".into(),
            channel_id: "telegram".into(),
            sender_id: "1001".into(),
            thread_id: Some(chat.into()),
            is_group: false,
            content: content.to_string(),
            callback_token: (kind == InboundMessageKind::Callback).then(|| "cb-1".to_string()),
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn other_chats_are_ignored() {
        let (gw, chat, ctx) = gateway();
        gw.handle_inbound(inbound(InboundMessageKind::Command, "999", "/check"))
            .await
            .expect("handle");
        assert!(chat.sent.lock().expect("lock").is_empty());
        assert!(!ctx.take_manual_trigger());
    }

    #[tokio::test]
    async fn trigger_keyword_requests_manual_check() {
        let (gw, chat, ctx) = gateway();
        gw.handle_inbound(inbound(InboundMessageKind::Message, "42", "can you diagnose it?"))
            .await
            .expect("handle");
        assert!(ctx.take_manual_trigger());
        assert_eq!(*chat.sent.lock().expect("lock"), vec![MANUAL_CHECK_REPLY]);
    }

    #[tokio::test]
    async fn approve_callback_resolves_outstanding_escalation() {
        let (gw, chat, ctx) = gateway();
        ctx.set_review("nginx down", "systemctl restart nginx");
        let armed = ctx.broker().arm("systemctl restart nginx");
        gw.handle_inbound(inbound(
            InboundMessageKind::Callback,
            "42",
            &format!("approve:{}", armed.id),
        ))
        .await
        .expect("handle");

        assert!(ctx.broker().outstanding().is_none());
        assert_eq!(*chat.acks.lock().expect("lock"), vec!["cb-1"]);
        assert_eq!(
            *chat.edits.lock().expect("lock"),
            vec!["✅ Action Approved: systemctl restart nginx"]
        );
    }

    #[tokio::test]
    async fn stale_callback_is_marked_expired() {
        let (gw, chat, ctx) = gateway();
        let _current = ctx.broker().arm("df -h");
        gw.handle_inbound(inbound(
            InboundMessageKind::Callback,
            "42",
            &format!("deny:{}", uuid::Uuid::new_v4()),
        ))
        .await
        .expect("handle");
        assert!(ctx.broker().outstanding().is_some());
        assert_eq!(
            *chat.edits.lock().expect("lock"),
            vec!["⌛ This approval request has expired."]
        );
    }

    #[tokio::test]
    async fn callback_edit_names_the_answered_action_not_the_review() {
        let (gw, chat, ctx) = gateway();
        ctx.set_review("disk almost full", "du -sh /var/log");
        let armed = ctx.broker().arm("journalctl --vacuum-size=200M");
        gw.handle_inbound(inbound(
            InboundMessageKind::Callback,
            "42",
            &format!("deny:{}", armed.id),
        ))
        .await
        .expect("handle");
        assert_eq!(
            *chat.edits.lock().expect("lock"),
            vec!["❌ Action Denied: journalctl --vacuum-size=200M"]
        );
    }

    #[tokio::test]
    async fn conversation_without_model_replies_offline() {
        let (gw, chat, _) = gateway();
        gw.handle_inbound(inbound(InboundMessageKind::Message, "42", "how is memory?"))
            .await
            .expect("handle");
        for _ in 0..100 {
            if !chat.sent.lock().expect("lock").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let sent = chat.sent.lock().expect("lock");
        assert!(sent[0].starts_with("😴 My AI brain is offline right now."));
    }
}
