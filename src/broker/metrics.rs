//! Broker counters and their render formats.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Upper bounds of the publish-duration histogram, in milliseconds.
const LATENCY_BUCKETS_MS: [u64; 8] = [1, 5, 10, 50, 100, 500, 1000, 5000];

#[derive(Debug, Default)]
struct TopicCounters {
    produced: u64,
    consumed: u64,
    failed: u64,
}

#[derive(Debug, Default)]
struct Histogram {
    bucket_counts: [u64; LATENCY_BUCKETS_MS.len() + 1],
    sum_ms: u64,
    count: u64,
}

/// Live counters owned by a broker instance.
pub struct BrokerMetrics {
    started: Instant,
    produced: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
    topics: Mutex<BTreeMap<String, TopicCounters>>,
    publish_latency: Mutex<Histogram>,
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            topics: Mutex::new(BTreeMap::new()),
            publish_latency: Mutex::new(Histogram::default()),
        }
    }
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_produced(&self, topic: &str, count: u64) {
        self.produced.fetch_add(count, Ordering::Relaxed);
        let mut topics = self.topics.lock().expect("metrics lock");
        topics.entry(topic.to_string()).or_default().produced += count;
    }

    pub fn record_consumed(&self, topic: &str, count: u64) {
        self.consumed.fetch_add(count, Ordering::Relaxed);
        let mut topics = self.topics.lock().expect("metrics lock");
        topics.entry(topic.to_string()).or_default().consumed += count;
    }

    pub fn record_failed(&self, topic: &str, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
        let mut topics = self.topics.lock().expect("metrics lock");
        topics.entry(topic.to_string()).or_default().failed += count;
    }

    pub fn record_publish_latency_ms(&self, ms: u64) {
        let mut hist = self.publish_latency.lock().expect("metrics lock");
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|le| ms <= *le)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        hist.bucket_counts[idx] += 1;
        hist.sum_ms += ms;
        hist.count += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let topics = self.topics.lock().expect("metrics lock");
        let hist = self.publish_latency.lock().expect("metrics lock");
        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            produced_total: self.produced.load(Ordering::Relaxed),
            consumed_total: self.consumed.load(Ordering::Relaxed),
            failed_total: self.failed.load(Ordering::Relaxed),
            topics: topics
                .iter()
                .map(|(name, c)| {
                    (
                        name.clone(),
                        TopicSnapshot {
                            produced: c.produced,
                            consumed: c.consumed,
                            failed: c.failed,
                        },
                    )
                })
                .collect(),
            publish_latency: HistogramSnapshot {
                buckets: LATENCY_BUCKETS_MS
                    .iter()
                    .zip(hist.bucket_counts.iter())
                    .map(|(le, count)| (*le, *count))
                    .collect(),
                overflow: hist.bucket_counts[LATENCY_BUCKETS_MS.len()],
                sum_ms: hist.sum_ms,
                count: hist.count,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicSnapshot {
    pub produced: u64,
    pub consumed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// (upper bound in ms, cumulative-from-zero count per bucket).
    pub buckets: Vec<(u64, u64)>,
    pub overflow: u64,
    pub sum_ms: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub produced_total: u64,
    pub consumed_total: u64,
    pub failed_total: u64,
    pub topics: BTreeMap<String, TopicSnapshot>,
    pub publish_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Prometheus text exposition. Metric names under `prefix` are stable.
    pub fn render_prometheus(&self, prefix: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# TYPE {prefix}_uptime_seconds gauge");
        let _ = writeln!(out, "{prefix}_uptime_seconds {}", self.uptime_seconds);

        for (name, total) in [
            ("produced_total", self.produced_total),
            ("consumed_total", self.consumed_total),
            ("failed_total", self.failed_total),
        ] {
            let _ = writeln!(out, "# TYPE {prefix}_{name} counter");
            let _ = writeln!(out, "{prefix}_{name} {total}");
        }

        for (topic, c) in &self.topics {
            let _ = writeln!(out, "{prefix}_produced_total{{topic=\"{topic}\"}} {}", c.produced);
            let _ = writeln!(out, "{prefix}_consumed_total{{topic=\"{topic}\"}} {}", c.consumed);
            let _ = writeln!(out, "{prefix}_failed_total{{topic=\"{topic}\"}} {}", c.failed);
        }

        let _ = writeln!(out, "# TYPE {prefix}_publish_duration_ms histogram");
        let mut cumulative = 0;
        for (le, count) in &self.publish_latency.buckets {
            cumulative += count;
            let _ = writeln!(
                out,
                "{prefix}_publish_duration_ms_bucket{{le=\"{le}\"}} {cumulative}"
            );
        }
        cumulative += self.publish_latency.overflow;
        let _ = writeln!(
            out,
            "{prefix}_publish_duration_ms_bucket{{le=\"+Inf\"}} {cumulative}"
        );
        let _ = writeln!(
            out,
            "{prefix}_publish_duration_ms_sum {}",
            self.publish_latency.sum_ms
        );
        let _ = writeln!(
            out,
            "{prefix}_publish_duration_ms_count {}",
            self.publish_latency.count
        );
        out
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "uptime     {:>12}s", self.uptime_seconds);
        let _ = writeln!(out, "produced   {:>12}", self.produced_total);
        let _ = writeln!(out, "consumed   {:>12}", self.consumed_total);
        let _ = writeln!(out, "failed     {:>12}", self.failed_total);
        if !self.topics.is_empty() {
            let _ = writeln!(out, "{:<24} {:>10} {:>10} {:>10}", "topic", "produced", "consumed", "failed");
            for (topic, c) in &self.topics {
                let _ = writeln!(
                    out,
                    "{:<24} {:>10} {:>10} {:>10}",
                    topic, c.produced, c.consumed, c.failed
                );
            }
        }
        out
    }
}
