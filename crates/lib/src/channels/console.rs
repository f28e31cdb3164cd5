//! Console channel: reads lines from stdin as messages addressed to the bot and
//! prints replies and scheduled deliveries to stdout. Keeps its own in-memory history
//! so the conversation context works the same way it does on a chat platform.

use crate::channels::inbound::{Author, HistoryMessage, InboundMessage};
use crate::channels::registry::{ChannelError, ChannelHandle};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Conversation id used for the single console conversation.
pub const CONSOLE_CONVERSATION: &str = "console";

const EXIT_COMMANDS: [&str; 2] = ["/exit", "/quit"];

pub struct ConsoleChannel {
    id: String,
    bot: Author,
    user: Author,
    running: AtomicBool,
    next_id: AtomicU64,
    history: RwLock<Vec<HistoryMessage>>,
}

impl ConsoleChannel {
    pub fn new(bot: Author, user: Author) -> Self {
        Self {
            id: "console".to_string(),
            bot,
            user,
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            history: RwLock::new(Vec::new()),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn next_message_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    async fn push_history(&self, author: Author, text: &str) -> String {
        let id = self.next_message_id();
        self.history.write().await.push(HistoryMessage {
            id: id.clone(),
            author,
            text: text.to_string(),
        });
        id
    }

    /// Record a line typed by the user and turn it into an inbound message that mentions the bot.
    pub async fn record_inbound(&self, line: &str) -> InboundMessage {
        let text = format!("<@{}> {}", self.bot.id, line.trim());
        let message_id = self.push_history(self.user.clone(), &text).await;
        InboundMessage {
            channel_id: self.id.clone(),
            conversation_id: CONSOLE_CONVERSATION.to_string(),
            message_id,
            author: self.user.clone(),
            text,
            mentions: vec![self.bot.id.clone()],
        }
    }

    /// Start reading stdin and forward each non-empty line. Returns a handle that completes on EOF, `/exit`, or stop.
    pub fn start_inbound(self: Arc<Self>, inbound_tx: mpsc::Sender<InboundMessage>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("console channel: reading from stdin");
        tokio::spawn(async move {
            run_stdin_loop(self, inbound_tx).await;
        })
    }
}

async fn run_stdin_loop(channel: Arc<ConsoleChannel>, inbound_tx: mpsc::Sender<InboundMessage>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while channel.running() {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("console: stdin read failed: {}", e);
                break;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if EXIT_COMMANDS.iter().any(|c| input.eq_ignore_ascii_case(c)) {
            break;
        }
        let inbound = channel.record_inbound(input).await;
        if inbound_tx.send(inbound).await.is_err() {
            log::debug!("console: inbound channel closed, stopping loop");
            return;
        }
    }
    channel.running.store(false, Ordering::SeqCst);
    log::info!("console channel: stdin loop stopped");
}

#[async_trait]
impl ChannelHandle for ConsoleChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn knows_conversation(&self, conversation_id: &str) -> bool {
        conversation_id == CONSOLE_CONVERSATION
    }

    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), ChannelError> {
        if conversation_id != CONSOLE_CONVERSATION {
            return Err(ChannelError::UnknownConversation(conversation_id.to_string()));
        }
        self.push_history(self.bot.clone(), text).await;
        println!("[{}] {}", self.bot.username, text);
        Ok(())
    }

    async fn reply(
        &self,
        conversation_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        if conversation_id != CONSOLE_CONVERSATION {
            return Err(ChannelError::UnknownConversation(conversation_id.to_string()));
        }
        self.push_history(self.bot.clone(), text).await;
        println!("< (re #{}) {}", message_id, text);
        Ok(())
    }

    async fn history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, ChannelError> {
        if conversation_id != CONSOLE_CONVERSATION {
            return Err(ChannelError::UnknownConversation(conversation_id.to_string()));
        }
        let g = self.history.read().await;
        Ok(g.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ConsoleChannel {
        ConsoleChannel::new(Author::bot("42", "courier"), Author::human("1", "you"))
    }

    #[tokio::test]
    async fn inbound_line_mentions_bot() {
        let ch = channel();
        let msg = ch.record_inbound("  hello  ").await;
        assert_eq!(msg.text, "<@42> hello");
        assert!(msg.mentions_user("42"));
        assert_eq!(msg.conversation_id, CONSOLE_CONVERSATION);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let ch = channel();
        ch.record_inbound("one").await;
        ch.send_message(CONSOLE_CONVERSATION, "two").await.unwrap();
        ch.record_inbound("three").await;
        let h = ch.history(CONSOLE_CONVERSATION, 2).await.unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h[0].text, "<@42> three");
        assert_eq!(h[1].text, "two");
        assert!(h[1].author.is_bot);
    }

    #[tokio::test]
    async fn unknown_conversation_is_rejected() {
        let ch = channel();
        assert!(matches!(
            ch.history("elsewhere", 5).await,
            Err(ChannelError::UnknownConversation(_))
        ));
        assert!(ch.send_message("elsewhere", "x").await.is_err());
        assert!(!ch.knows_conversation("elsewhere"));
        assert!(ch.knows_conversation(CONSOLE_CONVERSATION));
    }
}
