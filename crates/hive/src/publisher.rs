//! Outbound messages to devices.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hiveproto::bridge::{encode_frame, BridgeMessage};
use hiveproto::topic::{command_topic, config_topic, COMMAND_ZMQ_BRIDGE};
use serde_json::Value;
use tokio::sync::Notify;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// JSON to `/devices/{id}/commands/{command}`.
    async fn send_command(&self, device_id: &str, command: &str, payload: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.publish(&command_topic(device_id, command), bytes).await
    }

    /// JSON to `/devices/{id}/config`.
    async fn send_config(&self, device_id: &str, config: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(config)?;
        self.publish(&config_topic(device_id), bytes).await
    }
}

/// Encode `message` as a bridge frame and send it to the device.
pub async fn send_bridge<M: BridgeMessage>(
    publisher: &dyn Publisher,
    device_id: &str,
    message: &M,
) -> Result<()> {
    publisher
        .publish(&command_topic(device_id, COMMAND_ZMQ_BRIDGE), encode_frame(message))
        .await
}

/// One captured publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Keeps everything published in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    sent: Mutex<Vec<Published>>,
    changed: Notify,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Messages sent to topics ending in `suffix`.
    pub fn on_topic(&self, suffix: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic.ends_with(suffix))
            .collect()
    }

    /// Wait until at least `count` messages were published, or `limit`
    /// passes. Returns what was published either way.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> Vec<Published> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.changed.notified();
            let sent = self.published();
            if sent.len() >= count {
                return sent;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.published();
            }
        }
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let entry = Published {
            topic: topic.to_string(),
            payload,
        };
        match self.sent.lock() {
            Ok(mut sent) => sent.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
        self.changed.notify_waiters();
        Ok(())
    }
}
