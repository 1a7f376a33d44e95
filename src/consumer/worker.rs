//! Single-worker consume loop.
//!
//! Accumulates messages into a local batch and flushes when the batch is
//! full or old enough. Stop conditions: message cap, memory cap, stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::broker::Broker;
use crate::clock::Clock;
use crate::config::ConsumerConfig;
use crate::consumer::records::{hostname, ProcessRecordStore, WorkerRecord, WorkerStatus};
use crate::consumer::{dispatch_batch, Handler, HandlerContext};
use crate::error::Result;
use crate::ratelimit::adaptive::{LoadProbe, ProcLoadProbe};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub message_count: u64,
    pub error_count: u64,
}

pub struct ConsumerWorker {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn Handler>,
    config: ConsumerConfig,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    store: Option<ProcessRecordStore>,
    worker_id: String,
}

impl ConsumerWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn Handler>,
        config: ConsumerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            handler,
            config,
            clock,
            stop: Arc::new(AtomicBool::new(false)),
            store: None,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Record progress in the shared store for status tooling.
    pub fn with_record_store(mut self, store: ProcessRecordStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Flag checked between batches; set to request a stop.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn run(&self) -> Result<WorkerStats> {
        let started_at = self.clock.now_ns();
        let mut ctx = HandlerContext::new(
            self.config.driver.as_str(),
            self.handler.name(),
            self.worker_id.as_str(),
            started_at,
        );

        let mut record = self.make_record(started_at);
        self.save_record(&record);
        self.handler.on_start(&ctx);

        let memory_limit_bytes = self.config.memory_limit_mb * 1024 * 1024;
        let probe = ProcLoadProbe;

        let batch_timeout_ns = self.config.batch_timeout_ms * 1_000_000;
        let mut pending: Vec<crate::message::Message> = Vec::new();
        let mut batch_started_ns: Option<u64> = None;
        let mut first_heartbeat = true;

        let mut sink = |incoming: Vec<crate::message::Message>| -> bool {
            if !incoming.is_empty() && batch_started_ns.is_none() {
                batch_started_ns = Some(self.clock.now_ns());
            }
            pending.extend(incoming);

            let batch_full = pending.len() >= self.config.batch_size;
            let batch_aged = batch_started_ns
                .map(|started| self.clock.now_ns().saturating_sub(started) >= batch_timeout_ns)
                .unwrap_or(false);
            if batch_full || batch_aged {
                let batch = std::mem::take(&mut pending);
                batch_started_ns = None;
                ctx = dispatch_batch(self.handler.as_ref(), &batch, &ctx);
            }

            // First heartbeat moves the worker from starting to running.
            if first_heartbeat {
                first_heartbeat = false;
                record.status = WorkerStatus::Running;
            }
            record.last_heartbeat_ns = self.clock.now_ns();
            record.message_count = ctx.message_count;
            record.error_count = ctx.error_count;
            self.save_record(&record);

            !self.should_stop(&ctx, memory_limit_bytes, &probe)
        };

        let consume_result = self.broker.consume(
            self.config.timeout_ms,
            self.config.batch_size,
            &mut sink,
        );

        // Flush whatever is left before reporting.
        if !pending.is_empty() {
            ctx = dispatch_batch(self.handler.as_ref(), &pending, &ctx);
        }
        self.handler.on_stop(&ctx);

        record.status = if consume_result.is_ok() {
            WorkerStatus::Stopped
        } else {
            WorkerStatus::Failed
        };
        record.stopped_at_ns = Some(self.clock.now_ns());
        record.message_count = ctx.message_count;
        record.error_count = ctx.error_count;
        self.save_record(&record);
        consume_result?;

        Ok(WorkerStats {
            message_count: ctx.message_count,
            error_count: ctx.error_count,
        })
    }

    fn should_stop(&self, ctx: &HandlerContext, memory_limit_bytes: u64, probe: &ProcLoadProbe) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            log::info!("worker {} stopping on request", self.worker_id);
            return true;
        }
        if self.config.max_messages > 0 && ctx.message_count >= self.config.max_messages {
            log::info!(
                "worker {} reached max_messages={}",
                self.worker_id,
                self.config.max_messages
            );
            return true;
        }
        if memory_limit_bytes > 0 && probe.rss_bytes() >= memory_limit_bytes {
            log::warn!(
                "worker {} over memory limit ({} MB)",
                self.worker_id,
                self.config.memory_limit_mb
            );
            return true;
        }
        false
    }

    fn make_record(&self, started_at_ns: u64) -> WorkerRecord {
        WorkerRecord {
            id: self.worker_id.clone(),
            handler_name: self.handler.name().to_string(),
            driver: self.config.driver.clone(),
            pid: std::process::id(),
            hostname: hostname(),
            channels: self.handler.channels(),
            status: WorkerStatus::Starting,
            started_at_ns,
            last_heartbeat_ns: started_at_ns,
            stopped_at_ns: None,
            message_count: 0,
            error_count: 0,
            metadata: Default::default(),
        }
    }

    fn save_record(&self, record: &WorkerRecord) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(record) {
                log::warn!("cannot persist worker record {}: {err}", record.id);
            }
        }
    }
}
