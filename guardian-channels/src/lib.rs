//! Operator channels for the guardian.
//!
//! Adapters are pure I/O: they convert platform updates to/from
//! `InboundMessage` / `OutboundMessage`.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, Choice, InboundMessage, InboundMessageKind, MessageFormat, MessageId,
    OutboundMessage, SenderId, ThreadId,
};
