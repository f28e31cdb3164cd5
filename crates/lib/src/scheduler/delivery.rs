//! Delivery of fired jobs back to a channel conversation.

use async_trait::async_trait;
use std::sync::Arc;

use crate::channels::{ChannelError, ChannelRegistry};

/// Where a scheduled message goes: a registered channel and one of its conversations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTarget {
    pub channel_id: String,
    pub conversation_id: String,
}

impl DeliveryTarget {
    pub fn new(channel_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl std::fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.conversation_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("channel not registered: {0}")]
    UnknownChannel(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Called once per fired job.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, payload: &str, target: &DeliveryTarget) -> Result<(), DeliveryError>;
}

/// Sends fired payloads through the channel registry.
pub struct ChannelDelivery {
    registry: Arc<ChannelRegistry>,
}

impl ChannelDelivery {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Delivery for ChannelDelivery {
    async fn deliver(&self, payload: &str, target: &DeliveryTarget) -> Result<(), DeliveryError> {
        let handle = self
            .registry
            .get(&target.channel_id)
            .await
            .ok_or_else(|| DeliveryError::UnknownChannel(target.channel_id.clone()))?;
        handle.send_message(&target.conversation_id, payload).await?;
        Ok(())
    }
}
