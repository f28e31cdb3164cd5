//! Channel registry: register and lookup channels by id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::HistoryMessage;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not registered: {0}")]
    UnknownChannel(String),
    #[error("conversation not found: {0}")]
    UnknownConversation(String),
    #[error("{0} not supported by this channel")]
    Unsupported(&'static str),
    #[error("channel transport error: {0}")]
    Transport(String),
}

/// Handle to a running channel (stop, send, reply, read history).
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "console").
    fn id(&self) -> &str;
    /// Stop the channel connector.
    fn stop(&self);
    /// Whether `conversation_id` names a conversation this channel can post to.
    /// Default assumes any id is reachable.
    fn knows_conversation(&self, _conversation_id: &str) -> bool {
        true
    }
    /// Send a text message to a conversation. Default returns error.
    async fn send_message(&self, _conversation_id: &str, _text: &str) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported("send"))
    }
    /// Reply to a specific message, threaded where the platform supports it.
    /// Default falls back to a plain send.
    async fn reply(
        &self,
        conversation_id: &str,
        _message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        self.send_message(conversation_id, text).await
    }
    /// Up to `limit` most recent messages of a conversation, newest first.
    async fn history(
        &self,
        _conversation_id: &str,
        _limit: usize,
    ) -> Result<Vec<HistoryMessage>, ChannelError> {
        Err(ChannelError::Unsupported("history"))
    }
}

/// Registry of channel ids to handles. Shared across the runtime.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandle>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handle; a previous handle under the same id is stopped.
    pub async fn register(&self, id: String, handle: Arc<dyn ChannelHandle>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(id.clone(), handle) {
            old.stop();
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ChannelHandle>> {
        let g = self.inner.read().await;
        g.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let g = self.inner.read().await;
        g.keys().cloned().collect()
    }

    /// Stop every registered channel.
    pub async fn stop_all(&self) {
        let g = self.inner.read().await;
        for handle in g.values() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Dummy {
        id: String,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl ChannelHandle for Dummy {
        fn id(&self) -> &str {
            &self.id
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn dummy(id: &str) -> Arc<Dummy> {
        Arc::new(Dummy {
            id: id.to_string(),
            stopped: AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn reregister_stops_previous_handle() {
        let reg = ChannelRegistry::new();
        let first = dummy("console");
        reg.register("console".into(), first.clone()).await;
        reg.register("console".into(), dummy("console")).await;
        assert!(first.stopped.load(Ordering::SeqCst));
        assert_eq!(reg.ids().await, vec!["console".to_string()]);
    }

    #[tokio::test]
    async fn default_methods_report_unsupported() {
        let d = dummy("x");
        assert!(matches!(
            d.send_message("c", "hi").await,
            Err(ChannelError::Unsupported("send"))
        ));
        assert!(matches!(
            d.reply("c", "m", "hi").await,
            Err(ChannelError::Unsupported("send"))
        ));
        assert!(matches!(
            d.history("c", 5).await,
            Err(ChannelError::Unsupported("history"))
        ));
    }
}
