//! Per-sender chat history for the assistant, keyed by (channel_id, sender_id).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use guardian_channels::{ChannelId, SenderId};
use guardian_llm::{ChatMessage, Role, Usage};
use uuid::Uuid;

pub const MAX_HISTORY_MESSAGES: usize = 20;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub history: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub usage_totals: Usage,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            history: Vec::new(),
            created_at: now,
            last_active: now,
            usage_totals: Usage::default(),
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.usage_totals = Usage::default();
        self.last_active = Utc::now();
    }

    /// Drop the oldest messages beyond the cap. The kept window always starts
    /// at a user turn so no tool result loses its originating call.
    pub fn trim_history(&mut self) {
        if self.history.len() <= MAX_HISTORY_MESSAGES {
            return;
        }
        let mut start = self.history.len() - MAX_HISTORY_MESSAGES;
        while start < self.history.len() && self.history[start].role != Role::User {
            start += 1;
        }
        self.history.drain(..start);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionScope {
    channel_id: ChannelId,
    sender_id: SenderId,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<SessionScope, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create_mut(
        &self,
        channel_id: &str,
        sender_id: &str,
    ) -> RefMut<'_, SessionScope, Session> {
        let scope = SessionScope {
            channel_id: channel_id.into(),
            sender_id: sender_id.into(),
        };
        self.sessions.entry(scope).or_insert_with(Session::new)
    }

    /// Copy of the session, so callers can run I/O without holding a shard lock.
    pub fn checkout(&self, channel_id: &str, sender_id: &str) -> Session {
        self.get_or_create_mut(channel_id, sender_id).clone()
    }

    pub fn store(&self, channel_id: &str, sender_id: &str, session: Session) {
        *self.get_or_create_mut(channel_id, sender_id) = session;
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_are_isolated_per_sender() {
        let manager = SessionManager::new();
        manager
            .get_or_create_mut("telegram", "1")
            .history
            .push(ChatMessage::user("hi"));
        assert!(manager.get_or_create_mut("telegram", "2").history.is_empty());
        assert_eq!(manager.get_or_create_mut("telegram", "1").history.len(), 1);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn trimming_keeps_window_starting_at_user_turn() {
        let mut session = Session::new();
        for i in 0..8 {
            session.history.push(ChatMessage::user(format!("q{i}")));
            session.history.push(ChatMessage::assistant(""));
            session.history.push(ChatMessage::tool_result("call_0", "{}"));
        }
        session.trim_history();
        assert!(session.history.len() <= MAX_HISTORY_MESSAGES);
        assert_eq!(session.history[0].role, Role::User);
        assert_eq!(session.history.last().map(|m| m.role.clone()), Some(Role::Tool));
    }

    #[test]
    fn reset_clears_history() {
        let mut session = Session::new();
        session.history.push(ChatMessage::user("hi"));
        session.reset();
        assert!(session.history.is_empty());
    }
}
