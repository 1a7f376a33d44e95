//! Batching producer.
//!
//! A fluent builder gathers payloads for one (channel, event) pair, chunks
//! them at `internal_batch_size`, and flushes each chunk through the broker,
//! merging the per-chunk reports into a single [`BatchResult`].

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::broker::{BatchEntry, Broker};
use crate::channel::router::{validate_channel_name, validate_event_name};
use crate::error::{Error, Result};
use crate::message::Message;

const MIN_INTERNAL_BATCH: usize = 100;
const MAX_INTERNAL_BATCH: usize = 50_000;
const MIN_FLUSH_TIMEOUT_MS: u64 = 1000;

/// Payload bodies at or above this serialized size are gzip-compressed.
const DEFAULT_COMPRESS_MIN_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDetail {
    pub index: usize,
    pub size: u64,
    pub queued: u64,
    pub failed: u64,
    pub compressed_payloads: u64,
    pub duration_ms: u64,
}

/// Aggregate outcome of a batch publish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub total: u64,
    pub queued: u64,
    pub failed: u64,
    pub duration_ms: u64,
    pub throughput: f64,
    pub queue_time_ms: u64,
    pub flush_time_ms: u64,
    pub details: Vec<ChunkDetail>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.queued == self.total
    }
}

pub struct BatchProducer {
    broker: Arc<dyn Broker>,
    internal_batch_size: usize,
    flush_timeout_ms: u64,
    compress_min_bytes: usize,
}

impl BatchProducer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            internal_batch_size: 10_000,
            flush_timeout_ms: 10_000,
            compress_min_bytes: DEFAULT_COMPRESS_MIN_BYTES,
        }
    }

    /// Chunk size, clamped to 100..=50000.
    pub fn internal_batch_size(mut self, size: usize) -> Self {
        self.internal_batch_size = size.clamp(MIN_INTERNAL_BATCH, MAX_INTERNAL_BATCH);
        self
    }

    /// Per-chunk flush timeout; the floor is 1000 ms.
    pub fn flush_timeout_ms(mut self, ms: u64) -> Self {
        self.flush_timeout_ms = ms.max(MIN_FLUSH_TIMEOUT_MS);
        self
    }

    pub fn compress_min_bytes(mut self, bytes: usize) -> Self {
        self.compress_min_bytes = bytes;
        self
    }

    pub fn batch(&self) -> BatchBuilder<'_> {
        BatchBuilder {
            producer: self,
            channel: None,
            event: None,
            sources: Vec::new(),
        }
    }
}

enum PayloadSource {
    One(serde_json::Value),
    Many(Box<dyn Iterator<Item = serde_json::Value>>),
}

pub struct BatchBuilder<'a> {
    producer: &'a BatchProducer,
    channel: Option<String>,
    event: Option<String>,
    sources: Vec<PayloadSource>,
}

impl<'a> BatchBuilder<'a> {
    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channel = Some(name.into());
        self
    }

    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.event = Some(name.into());
        self
    }

    pub fn payload(mut self, value: serde_json::Value) -> Self {
        self.sources.push(PayloadSource::One(value));
        self
    }

    pub fn payloads<I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = serde_json::Value>,
        I::IntoIter: 'static,
    {
        self.sources
            .push(PayloadSource::Many(Box::new(values.into_iter())));
        self
    }

    /// Map `items` through `f` lazily, so large inputs are not expanded
    /// in memory before publish.
    pub fn each<T, I, F>(mut self, items: I, f: F) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
        F: Fn(T) -> serde_json::Value + 'static,
    {
        self.sources
            .push(PayloadSource::Many(Box::new(items.into_iter().map(f))));
        self
    }

    /// Validate, chunk, flush, and merge.
    pub fn publish(self) -> Result<BatchResult> {
        let channel = self
            .channel
            .ok_or_else(|| Error::ChannelValidation("batch has no channel".to_string()))?;
        let event = self
            .event
            .ok_or_else(|| Error::ChannelValidation("batch has no event".to_string()))?;
        validate_channel_name(&channel)?;
        validate_event_name(&event)?;

        let producer = self.producer;
        let start = Instant::now();
        let mut result = BatchResult::default();

        let mut chunk: Vec<BatchEntry> = Vec::new();
        let mut chunk_compressed = 0u64;
        let mut payloads = self.sources.into_iter().flat_map(|source| match source {
            PayloadSource::One(value) => {
                Box::new(std::iter::once(value)) as Box<dyn Iterator<Item = serde_json::Value>>
            }
            PayloadSource::Many(iter) => iter,
        });

        loop {
            let mut exhausted = false;
            while chunk.len() < producer.internal_batch_size {
                match payloads.next() {
                    Some(payload) => {
                        let (data, compressed) =
                            maybe_compress(payload, producer.compress_min_bytes)?;
                        if compressed {
                            chunk_compressed += 1;
                        }
                        chunk.push(BatchEntry {
                            channel: channel.clone(),
                            message: Message::event(channel.clone(), event.clone(), data),
                        });
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }

            if !chunk.is_empty() {
                flush_chunk(
                    producer,
                    &mut result,
                    std::mem::take(&mut chunk),
                    std::mem::take(&mut chunk_compressed),
                );
            }
            if exhausted {
                break;
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        result.throughput = if result.duration_ms > 0 {
            result.queued as f64 / (result.duration_ms as f64 / 1000.0)
        } else {
            result.queued as f64
        };
        Ok(result)
    }
}

fn flush_chunk(
    producer: &BatchProducer,
    result: &mut BatchResult,
    chunk: Vec<BatchEntry>,
    compressed_payloads: u64,
) {
    let size = chunk.len() as u64;
    result.total += size;

    let chunk_start = Instant::now();
    let mut detail = ChunkDetail {
        index: result.details.len(),
        size,
        compressed_payloads,
        ..ChunkDetail::default()
    };

    match producer
        .broker
        .publish_batch(chunk, producer.flush_timeout_ms)
    {
        Ok(report) => {
            result.queued += report.queued;
            result.failed += report.failed;
            result.queue_time_ms += report.queue_time_ms;
            result.flush_time_ms += report.flush_time_ms;
            detail.queued = report.queued;
            detail.failed = report.failed;
        }
        Err(err) => {
            // Broker outage: the whole chunk counts as failed and the
            // caller reads it from the result, not from an error.
            log::warn!("batch chunk publish failed: {err}");
            result.failed += size;
            detail.failed = size;
        }
    }
    detail.duration_ms = chunk_start.elapsed().as_millis() as u64;
    result.details.push(detail);
}

/// Compress a payload body when it is large enough to be worth it.
///
/// Returns the (possibly wrapped) payload and whether it was compressed.
fn maybe_compress(
    payload: serde_json::Value,
    min_bytes: usize,
) -> Result<(serde_json::Value, bool)> {
    let raw = serde_json::to_vec(&payload)?;
    if raw.len() < min_bytes {
        return Ok((payload, false));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;
    let wrapped = serde_json::json!({
        "compressed": true,
        "encoding": "gzip+base64",
        "body": BASE64.encode(compressed),
    });
    Ok((wrapped, true))
}

/// Undo [`maybe_compress`] on the consumer side. Uncompressed payloads pass
/// through unchanged.
pub fn decompress_payload(payload: &serde_json::Value) -> Result<serde_json::Value> {
    let is_wrapped = payload
        .get("compressed")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if !is_wrapped {
        return Ok(payload.clone());
    }
    let body = payload
        .get("body")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::SerializationFailed("compressed payload has no body".to_string()))?;
    let compressed = BASE64
        .decode(body)
        .map_err(|e| Error::SerializationFailed(format!("bad base64 body: {e}")))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn producer(broker: Arc<MemoryBroker>) -> BatchProducer {
        BatchProducer::new(broker)
    }

    #[test]
    fn empty_batch_returns_all_zero_result() {
        let broker = Arc::new(MemoryBroker::new());
        let result = producer(broker)
            .batch()
            .channel("orders")
            .event("created")
            .publish()
            .expect("publish");
        assert_eq!(result.total, 0);
        assert_eq!(result.queued, 0);
        assert_eq!(result.failed, 0);
        assert!(result.is_success());
    }

    #[test]
    fn invalid_event_name_never_reaches_the_broker() {
        let broker = Arc::new(MemoryBroker::new());
        let err = producer(broker.clone())
            .batch()
            .channel("orders")
            .event("bad event")
            .payload(serde_json::json!(1))
            .publish()
            .expect_err("must fail");
        assert!(matches!(err, Error::ChannelValidation(_)));
        assert_eq!(broker.pending_len(), 0);
    }

    #[test]
    fn compression_round_trip() {
        let big = serde_json::json!({ "blob": "x".repeat(64 * 1024) });
        let (wrapped, compressed) = maybe_compress(big.clone(), 1024).expect("compress");
        assert!(compressed);
        let restored = decompress_payload(&wrapped).expect("decompress");
        assert_eq!(restored, big);

        let small = serde_json::json!({ "n": 1 });
        let (passthrough, compressed) = maybe_compress(small.clone(), 1024).expect("compress");
        assert!(!compressed);
        assert_eq!(decompress_payload(&passthrough).expect("decompress"), small);
    }
}
