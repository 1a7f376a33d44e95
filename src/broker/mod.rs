//! Broker adapter contract.
//!
//! One uniform surface over pluggable backends. Per-channel partition order
//! is preserved end-to-end; messages are never acknowledged before the
//! handler returns.

pub mod guarded;
pub mod memory;
pub mod metrics;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;

pub use guarded::GuardedBroker;
pub use memory::MemoryBroker;
pub use metrics::{BrokerMetrics, MetricsSnapshot};

/// One message bound for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub channel: String,
    pub message: Message,
}

/// Outcome of a `publish_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishReport {
    pub queued: u64,
    pub failed: u64,
    pub queue_time_ms: u64,
    pub flush_time_ms: u64,
    pub total_time_ms: u64,
    /// Messages per second over the whole call.
    pub throughput: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerHealth {
    pub status: HealthStatus,
    pub latency_ms: f64,
    pub details: HashMap<String, String>,
}

/// Push-delivery callback; return false to end the subscription.
pub type SubscribeHandler = Box<dyn FnMut(&Message) -> bool + Send>;

/// Pull-delivery sink for `consume`. Receives each drained batch (empty on
/// a poll timeout so callers can flush aged batches) and returns false to
/// stop the loop. Handed messages count as processed; failure handling
/// happens inside the sink.
pub type ConsumeSink<'a> = &'a mut dyn FnMut(Vec<Message>) -> bool;

pub trait Broker: Send + Sync {
    /// Begin push delivery for one channel.
    fn subscribe(&self, channel: &str, handler: SubscribeHandler) -> Result<()>;

    /// Best-effort single publish.
    fn publish(&self, channel: &str, message: &Message) -> Result<()>;

    /// Publish a prepared batch, flushing within `flush_timeout_ms`.
    fn publish_batch(&self, entries: Vec<BatchEntry>, flush_timeout_ms: u64)
        -> Result<PublishReport>;

    /// Blocking poll loop over the configured topics.
    fn consume(
        &self,
        poll_timeout_ms: u64,
        batch_size: usize,
        sink: ConsumeSink<'_>,
    ) -> Result<()>;

    fn health_check(&self) -> BrokerHealth;

    fn is_connected(&self) -> bool;

    fn metrics(&self) -> MetricsSnapshot;
}
