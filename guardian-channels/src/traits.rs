use crate::types::{InboundMessage, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a message and return the platform id of the delivered message.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId>;

    /// Replace the text of a previously sent message, dropping its buttons.
    async fn edit(&self, _recipient_id: &str, _message_id: &MessageId, _content: &str) -> Result<()> {
        Err(anyhow::anyhow!("edit is not supported by this channel"))
    }

    /// Tell the platform a button press was handled.
    async fn acknowledge_choice(&self, _callback_token: &str) -> Result<()> {
        Ok(())
    }

    /// Send typing state updates where supported.
    async fn send_typing(&self, _recipient_id: &str) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_typing is not supported by this channel"
        ))
    }
}
