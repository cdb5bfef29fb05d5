//! Downstream event sinks.
//!
//! Events are handed off only after the transaction that produced them has
//! committed. Hand-off is fire-and-forget: a failing sink is logged and never
//! rolls back or stalls indexing.

use async_trait::async_trait;
use metrics::counter;
use tidemark_core::Message;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Receiver of derived events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, messages: Vec<Message>) -> Result<()>;
}

/// Hand `messages` to `sink`, logging instead of failing.
pub async fn emit_all(sink: &dyn EventSink, messages: Vec<Message>) {
    if messages.is_empty() {
        return;
    }
    let count = messages.len() as u64;
    match sink.emit(messages).await {
        Ok(()) => counter!("subscription_events_emitted_total").increment(count),
        Err(e) => tracing::warn!(error = %e, count, "Event sink rejected messages"),
    }
}

/// Forwards events into a bounded tokio channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, messages: Vec<Message>) -> Result<()> {
        for message in messages {
            self.tx
                .send(message)
                .await
                .map_err(|_| Error::ChannelSend("event channel closed".to_string()))?;
        }
        Ok(())
    }
}

/// Logs every event; used when no downstream consumer is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&self, messages: Vec<Message>) -> Result<()> {
        for message in &messages {
            match serde_json::to_string(message) {
                Ok(json) => tracing::info!(kind = message.kind(), "event {}", json),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
            }
        }
        Ok(())
    }
}
