//! Conversation context: turn a channel's recent history into the ordered message
//! list the model sees, with an optional system directive in front.
//!
//! The directive is resolved once per build from a [`SystemPrompt`]: a provider
//! function (e.g. re-reading `SYSTEM.md` from the workspace) wins over the static prompt.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use crate::channels::{Author, ChannelError, ChannelHandle, HistoryMessage};
use crate::llm::ChatMessage;

/// Platform mention markup: users `<@id>`, `<@!id>`, roles `<@&id>`, channels `<#id>`.
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:@[!&]?|#)[\w-]+>").expect("valid mention regex"));

const FALLBACK_NAME: &str = "user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Human,
    Agent,
    System,
}

/// One entry of the conversation handed to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationMessage {
    pub author: String,
    pub role: Role,
    pub text: String,
    /// Id of the channel message this entry was built from (empty for the system directive).
    pub source_id: String,
}

impl ConversationMessage {
    fn from_history(msg: &HistoryMessage) -> Self {
        let content = sanitize_mentions(&msg.text);
        let name = display_name(&msg.author);
        if msg.author.is_bot {
            Self {
                author: name,
                role: Role::Agent,
                text: content,
                source_id: msg.id.clone(),
            }
        } else {
            Self {
                text: format!("{}: {}", name, content),
                author: name,
                role: Role::Human,
                source_id: msg.id.clone(),
            }
        }
    }

    fn system(text: String) -> Self {
        Self {
            author: String::new(),
            role: Role::System,
            text,
            source_id: String::new(),
        }
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        match self.role {
            Role::Human => ChatMessage::user(self.text.clone()),
            Role::Agent => ChatMessage::assistant(self.text.clone()),
            Role::System => ChatMessage::system(self.text.clone()),
        }
    }
}

type PromptProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Where the system directive comes from: a fixed prompt, a provider, or both.
#[derive(Clone, Default)]
pub struct SystemPrompt {
    prompt: Option<String>,
    provider: Option<PromptProvider>,
}

impl std::fmt::Debug for SystemPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemPrompt")
            .field("prompt", &self.prompt)
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

impl SystemPrompt {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fixed(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            provider: None,
        }
    }

    pub fn with_provider(
        mut self,
        provider: impl Fn() -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Provider result first, then the static prompt; blank text counts as absent.
    pub fn resolve(&self) -> Option<String> {
        let from_provider = self.provider.as_ref().and_then(|p| p());
        from_provider
            .or_else(|| self.prompt.clone())
            .filter(|s| !s.trim().is_empty())
    }
}

/// Builds model context from a channel's history.
#[derive(Debug, Clone)]
pub struct ConversationContextBuilder {
    system_prompt: SystemPrompt,
}

impl ConversationContextBuilder {
    pub fn new(system_prompt: SystemPrompt) -> Self {
        Self { system_prompt }
    }

    /// Fetch up to `limit` recent messages and return them oldest first, preceded by
    /// the system directive when one resolves. History errors propagate.
    pub async fn build(
        &self,
        channel: &dyn ChannelHandle,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, ChannelError> {
        let history = channel.history(conversation_id, limit).await?;
        let mut messages: Vec<ConversationMessage> = history
            .iter()
            .take(limit)
            .map(ConversationMessage::from_history)
            .collect();
        // History is newest first: the directive goes last so it lands first after reversing.
        if let Some(directive) = self.system_prompt.resolve() {
            messages.push(ConversationMessage::system(directive));
        }
        messages.reverse();
        Ok(messages)
    }
}

/// Remove mention markup and tidy the whitespace it leaves behind.
pub fn sanitize_mentions(text: &str) -> String {
    let stripped = MENTION_RE.replace_all(text, "");
    stripped
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Display name, else username, trimmed; falls back to "user".
pub fn display_name(author: &Author) -> String {
    author
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| Some(author.username.trim()).filter(|s| !s.is_empty()))
        .unwrap_or(FALLBACK_NAME)
        .to_string()
}

/// Path of the workspace system prompt file.
pub fn system_prompt_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join("SYSTEM.md")
}

/// Load the system prompt from the workspace (`SYSTEM.md`).
///
/// Returns the file contents when it exists and is non-empty; otherwise None.
pub fn load_system_prompt(workspace_dir: Option<&Path>) -> Option<String> {
    let dir = workspace_dir?;
    match fs::read_to_string(system_prompt_path(dir)) {
        Ok(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FakeHistory {
        messages: Vec<HistoryMessage>,
        fail: bool,
    }

    #[async_trait]
    impl ChannelHandle for FakeHistory {
        fn id(&self) -> &str {
            "fake"
        }
        fn stop(&self) {}
        async fn history(
            &self,
            _conversation_id: &str,
            limit: usize,
        ) -> Result<Vec<HistoryMessage>, ChannelError> {
            if self.fail {
                return Err(ChannelError::Transport("offline".into()));
            }
            Ok(self.messages.iter().take(limit).cloned().collect())
        }
    }

    fn msg(id: &str, author: Author, text: &str) -> HistoryMessage {
        HistoryMessage {
            id: id.into(),
            author,
            text: text.into(),
        }
    }

    fn newest_first() -> FakeHistory {
        let mut alice = Author::human("1", "alice");
        alice.display_name = Some("  Alice  ".into());
        FakeHistory {
            messages: vec![
                msg("3", Author::bot("9", "courier"), "hello Alice"),
                msg("2", alice.clone(), "<@9> hi there"),
                msg("1", Author::human("2", "bob"), "earlier <#55> note"),
            ],
            fail: false,
        }
    }

    #[tokio::test]
    async fn builds_oldest_first_with_system_directive_first() {
        let b = ConversationContextBuilder::new(SystemPrompt::fixed("be kind"));
        let ctx = b.build(&newest_first(), "c", 10).await.unwrap();
        assert_eq!(ctx.len(), 4);
        assert_eq!(ctx[0].role, Role::System);
        assert_eq!(ctx[0].text, "be kind");
        assert_eq!(ctx[1].text, "bob: earlier note");
        assert_eq!(ctx[2].text, "Alice: hi there");
        assert_eq!(ctx[2].role, Role::Human);
        assert_eq!(ctx[3].role, Role::Agent);
        assert_eq!(ctx[3].text, "hello Alice");
        assert_eq!(ctx[3].source_id, "3");
    }

    #[tokio::test]
    async fn limit_keeps_most_recent() {
        let b = ConversationContextBuilder::new(SystemPrompt::none());
        let ctx = b.build(&newest_first(), "c", 2).await.unwrap();
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx[0].source_id, "2");
        assert_eq!(ctx[1].source_id, "3");
    }

    #[tokio::test]
    async fn history_failure_propagates() {
        let b = ConversationContextBuilder::new(SystemPrompt::none());
        let ch = FakeHistory {
            messages: vec![],
            fail: true,
        };
        assert!(matches!(
            b.build(&ch, "c", 10).await,
            Err(ChannelError::Transport(_))
        ));
    }

    #[test]
    fn provider_wins_over_static_prompt() {
        let p = SystemPrompt::fixed("static").with_provider(|| Some("dynamic".into()));
        assert_eq!(p.resolve().as_deref(), Some("dynamic"));
        let p = SystemPrompt::fixed("static").with_provider(|| None);
        assert_eq!(p.resolve().as_deref(), Some("static"));
        let p = SystemPrompt::fixed("   ");
        assert_eq!(p.resolve(), None);
    }

    #[test]
    fn sanitize_strips_all_mention_kinds() {
        assert_eq!(
            sanitize_mentions("<@123> hey <@!456> and <@&7> in <#8>"),
            "hey and in"
        );
        assert_eq!(sanitize_mentions("no mentions"), "no mentions");
    }

    #[test]
    fn display_name_falls_back() {
        let mut a = Author::human("1", "  ");
        assert_eq!(display_name(&a), "user");
        a.display_name = Some("Nick".into());
        assert_eq!(display_name(&a), "Nick");
    }

    #[test]
    fn load_system_prompt_reads_workspace_file() {
        let dir = std::env::temp_dir().join(format!("courier-ctx-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(load_system_prompt(Some(&dir)), None);
        std::fs::write(system_prompt_path(&dir), "you are courier").unwrap();
        assert_eq!(
            load_system_prompt(Some(&dir)).as_deref(),
            Some("you are courier")
        );
        std::fs::write(system_prompt_path(&dir), "  \n").unwrap();
        assert_eq!(load_system_prompt(Some(&dir)), None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
