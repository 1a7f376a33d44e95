//! Circuit-breaker gate in front of a broker.
//!
//! Publish and consume report every outcome to the breaker; while the
//! circuit is open, calls fail fast with `BrokerUnavailable` instead of
//! touching the backend.

use std::sync::Arc;

use crate::broker::{
    BatchEntry, Broker, BrokerHealth, ConsumeSink, MetricsSnapshot, PublishReport,
    SubscribeHandler,
};
use crate::circuit::CircuitBreaker;
use crate::error::{Error, Result};
use crate::message::Message;

pub struct GuardedBroker {
    inner: Arc<dyn Broker>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedBroker {
    pub fn new(inner: Arc<dyn Broker>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn gate(&self) -> Result<()> {
        if self.breaker.allow() {
            Ok(())
        } else {
            Err(Error::BrokerUnavailable("circuit open".to_string()))
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }
}

impl Broker for GuardedBroker {
    fn subscribe(&self, channel: &str, handler: SubscribeHandler) -> Result<()> {
        self.inner.subscribe(channel, handler)
    }

    fn publish(&self, channel: &str, message: &Message) -> Result<()> {
        self.gate()?;
        let result = self.inner.publish(channel, message);
        self.observe(result)
    }

    fn publish_batch(
        &self,
        entries: Vec<BatchEntry>,
        flush_timeout_ms: u64,
    ) -> Result<PublishReport> {
        self.gate()?;
        let result = self.inner.publish_batch(entries, flush_timeout_ms);
        self.observe(result)
    }

    fn consume(
        &self,
        poll_timeout_ms: u64,
        batch_size: usize,
        sink: ConsumeSink<'_>,
    ) -> Result<()> {
        self.gate()?;
        let result = self.inner.consume(poll_timeout_ms, batch_size, sink);
        self.observe(result)
    }

    fn health_check(&self) -> BrokerHealth {
        self.inner.health_check()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics()
    }
}
