//! In-memory broker backend.
//!
//! Single-partition semantics: one FIFO pending queue shared by the
//! consumer path, which preserves per-channel order trivially. Push
//! subscribers are invoked synchronously on publish.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::broker::{
    BatchEntry, Broker, BrokerHealth, BrokerMetrics, ConsumeSink, HealthStatus, MetricsSnapshot,
    PublishReport, SubscribeHandler,
};
use crate::error::{Error, Result};
use crate::message::Message;

pub struct MemoryBroker {
    pending: Mutex<VecDeque<Message>>,
    wakeup: Condvar,
    subscribers: Mutex<HashMap<String, Vec<SubscribeHandler>>>,
    /// Serializes consumers; the memory backend models one consumer group.
    consume_guard: Mutex<()>,
    connected: AtomicBool,
    metrics: BrokerMetrics,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            subscribers: Mutex::new(HashMap::new()),
            consume_guard: Mutex::new(()),
            connected: AtomicBool::new(true),
            metrics: BrokerMetrics::new(),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage; publish and consume start failing.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::BrokerUnavailable("memory broker disconnected".to_string()))
        }
    }

    fn fan_out(&self, channel: &str, message: &Message) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        let drained = if let Some(handlers) = subscribers.get_mut(channel) {
            handlers.retain_mut(|handler| handler(message));
            handlers.is_empty()
        } else {
            false
        };
        if drained {
            subscribers.remove(channel);
        }
    }

    fn enqueue(&self, message: Message) {
        let mut pending = self.pending.lock().expect("pending lock");
        pending.push_back(message);
        self.wakeup.notify_all();
    }
}

impl Broker for MemoryBroker {
    fn subscribe(&self, channel: &str, handler: SubscribeHandler) -> Result<()> {
        self.ensure_connected()?;
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .entry(channel.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    fn publish(&self, channel: &str, message: &Message) -> Result<()> {
        self.ensure_connected()?;
        self.fan_out(channel, message);
        self.enqueue(message.clone());
        self.metrics.record_produced(channel, 1);
        Ok(())
    }

    fn publish_batch(
        &self,
        entries: Vec<BatchEntry>,
        _flush_timeout_ms: u64,
    ) -> Result<PublishReport> {
        let total = entries.len() as u64;
        let start = Instant::now();
        self.ensure_connected()?;

        // Queue phase: fan out and append under one lock acquisition each.
        for entry in &entries {
            self.fan_out(&entry.channel, &entry.message);
        }
        {
            let mut pending = self.pending.lock().expect("pending lock");
            for entry in &entries {
                pending.push_back(entry.message.clone());
            }
        }
        self.wakeup.notify_all();
        let queue_time = start.elapsed();

        for entry in &entries {
            self.metrics.record_produced(&entry.channel, 1);
        }

        // The memory backend has no flush latency.
        let total_time = start.elapsed();
        let total_ms = total_time.as_millis() as u64;
        self.metrics.record_publish_latency_ms(total_ms);
        Ok(PublishReport {
            queued: total,
            failed: 0,
            queue_time_ms: queue_time.as_millis() as u64,
            flush_time_ms: total_ms.saturating_sub(queue_time.as_millis() as u64),
            total_time_ms: total_ms,
            throughput: if total_time.as_secs_f64() > 0.0 {
                total as f64 / total_time.as_secs_f64()
            } else {
                total as f64
            },
        })
    }

    fn consume(
        &self,
        poll_timeout_ms: u64,
        batch_size: usize,
        sink: ConsumeSink<'_>,
    ) -> Result<()> {
        let _guard = self.consume_guard.lock().expect("consume guard");
        let poll_timeout = Duration::from_millis(poll_timeout_ms.max(1));
        loop {
            self.ensure_connected()?;

            // Peek a batch without removing it; removal happens only after
            // the sink returns.
            let batch: Vec<Message> = {
                let mut pending = self.pending.lock().expect("pending lock");
                if pending.is_empty() {
                    let (guard, _timeout) = self
                        .wakeup
                        .wait_timeout(pending, poll_timeout)
                        .expect("pending lock");
                    pending = guard;
                }
                pending.iter().take(batch_size.max(1)).cloned().collect()
            };

            let keep_going = sink(batch.clone());

            if !batch.is_empty() {
                let mut pending = self.pending.lock().expect("pending lock");
                for _ in 0..batch.len() {
                    pending.pop_front();
                }
                for msg in &batch {
                    let topic = msg.channel.as_deref().unwrap_or("-");
                    self.metrics.record_consumed(topic, 1);
                }
            }

            if !keep_going {
                return Ok(());
            }
        }
    }

    fn health_check(&self) -> BrokerHealth {
        let start = Instant::now();
        let depth = self.pending_len();
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let status = if self.connected.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        let mut details = HashMap::new();
        details.insert("driver".to_string(), "memory".to_string());
        details.insert("pending".to_string(), depth.to_string());
        BrokerHealth {
            status,
            latency_ms,
            details,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn publish_reaches_push_subscribers_in_order() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        broker
            .subscribe(
                "orders",
                Box::new(move |msg: &Message| {
                    sink.lock().expect("seen lock").push(msg.data.clone());
                    true
                }),
            )
            .expect("subscribe");

        for i in 0..3 {
            let msg = Message::event("orders", "created", serde_json::json!(i));
            broker.publish("orders", &msg).expect("publish");
        }
        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec![
                serde_json::json!(0),
                serde_json::json!(1),
                serde_json::json!(2)
            ]
        );
    }

    #[test]
    fn consume_acks_only_after_sink_returns() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            let msg = Message::event("orders", "created", serde_json::json!(i));
            broker.publish("orders", &msg).expect("publish");
        }

        let mut seen = 0;
        broker
            .consume(10, 2, &mut |batch| {
                seen += batch.len();
                seen < 5
            })
            .expect("consume");
        assert_eq!(seen, 5);
        assert_eq!(broker.pending_len(), 0);
    }

    #[test]
    fn disconnected_broker_fails_publish() {
        let broker = MemoryBroker::new();
        broker.set_connected(false);
        let msg = Message::event("orders", "created", serde_json::Value::Null);
        assert!(matches!(
            broker.publish("orders", &msg),
            Err(Error::BrokerUnavailable(_))
        ));
    }
}
