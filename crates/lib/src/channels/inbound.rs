//! Inbound message from a channel, plus the history entries channels hand back.

/// Who wrote a message, as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub username: String,
    /// Server/guild nickname or profile display name, when set.
    pub display_name: Option<String>,
    /// True for bot accounts (including this agent).
    pub is_bot: bool,
}

impl Author {
    pub fn human(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            display_name: None,
            is_bot: false,
        }
    }

    pub fn bot(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            display_name: None,
            is_bot: true,
        }
    }
}

/// A message from a channel to be dispatched by the agent.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub author: Author,
    /// Raw text including any mention markup (e.g. `<@123> hello`).
    pub text: String,
    /// User ids mentioned in the message.
    pub mentions: Vec<String>,
}

impl InboundMessage {
    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|m| m == user_id)
    }
}

/// One message from a conversation's history (`ChannelHandle::history` returns newest first).
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub id: String,
    pub author: Author,
    pub text: String,
}
