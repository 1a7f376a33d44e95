//! Handler contract, registry, and dispatch.
//!
//! Handler failures never propagate into the broker consume loop: they are
//! folded into the context error count and the per-message failure path.

pub mod records;
pub mod supervisor;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::Message;

pub use records::{ProcessRecordStore, WorkerRecord, WorkerStatus};
pub use supervisor::{ExecLauncher, Supervisor, WorkerLauncher};
pub use worker::{ConsumerWorker, WorkerStats};

/// Execution context handed to handlers; updated immutably after each batch.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub driver: String,
    pub handler_name: String,
    pub channel: Option<String>,
    pub process_id: String,
    pub started_at_ns: u64,
    pub message_count: u64,
    pub error_count: u64,
}

impl HandlerContext {
    pub fn new(
        driver: impl Into<String>,
        handler_name: impl Into<String>,
        process_id: impl Into<String>,
        started_at_ns: u64,
    ) -> Self {
        Self {
            driver: driver.into(),
            handler_name: handler_name.into(),
            channel: None,
            process_id: process_id.into(),
            started_at_ns,
            message_count: 0,
            error_count: 0,
        }
    }

    /// A copy with the counters advanced by one batch's outcome.
    pub fn after_batch(&self, processed: u64, failed: u64) -> Self {
        let mut next = self.clone();
        next.message_count += processed;
        next.error_count += failed;
        next
    }
}

/// A named message handler.
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// Channels this handler consumes.
    fn channels(&self) -> Vec<String>;

    fn handle(&self, msg: &Message, ctx: &HandlerContext) -> Result<()>;

    /// Batch-aware handlers opt in and report failed indexes from
    /// `handle_batch`.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Returns the indexes of messages that failed.
    fn handle_batch(&self, msgs: &[Message], ctx: &HandlerContext) -> Vec<usize> {
        let _ = (msgs, ctx);
        Vec::new()
    }

    fn on_start(&self, ctx: &HandlerContext) {
        let _ = ctx;
    }

    fn on_stop(&self, ctx: &HandlerContext) {
        let _ = ctx;
    }

    fn on_failed(&self, msg: &Message, err: &Error, ctx: &HandlerContext) {
        log::error!(
            "handler {} failed on message {}: {err}",
            ctx.handler_name,
            msg.id
        );
    }
}

/// Name -> handler map. Effectively immutable once consumers start.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("unknown handler '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Deliver one batch, swallowing handler failures into the context.
///
/// Returns the context advanced by this batch.
pub fn dispatch_batch(
    handler: &dyn Handler,
    batch: &[Message],
    ctx: &HandlerContext,
) -> HandlerContext {
    if batch.is_empty() {
        return ctx.clone();
    }

    let failed = if handler.supports_batch() {
        let failed_indexes = handler.handle_batch(batch, ctx);
        for index in &failed_indexes {
            if let Some(msg) = batch.get(*index) {
                let err = Error::HandlerFailure(format!("batch index {index}"));
                handler.on_failed(msg, &err, ctx);
            }
        }
        failed_indexes.len() as u64
    } else {
        let mut failed = 0;
        for msg in batch {
            if let Err(err) = handler.handle(msg, ctx) {
                handler.on_failed(msg, &err, ctx);
                failed += 1;
            }
        }
        failed
    };

    ctx.after_batch(batch.len() as u64, failed)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Flaky {
        failed_ids: Mutex<Vec<String>>,
    }

    impl Handler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn channels(&self) -> Vec<String> {
            vec!["orders".to_string()]
        }
        fn handle(&self, msg: &Message, _ctx: &HandlerContext) -> Result<()> {
            if msg.data == serde_json::json!("bad") {
                return Err(Error::HandlerFailure("bad payload".to_string()));
            }
            Ok(())
        }
        fn on_failed(&self, msg: &Message, _err: &Error, _ctx: &HandlerContext) {
            self.failed_ids
                .lock()
                .expect("failed lock")
                .push(msg.id.clone());
        }
    }

    #[test]
    fn failures_are_counted_not_propagated() {
        let handler = Flaky {
            failed_ids: Mutex::new(Vec::new()),
        };
        let batch = vec![
            Message::event("orders", "e", serde_json::json!("ok")),
            Message::event("orders", "e", serde_json::json!("bad")),
            Message::event("orders", "e", serde_json::json!("ok")),
        ];
        let ctx = HandlerContext::new("memory", "flaky", "p1", 0);
        let next = dispatch_batch(&handler, &batch, &ctx);

        assert_eq!(next.message_count, 3);
        assert_eq!(next.error_count, 1);
        assert_eq!(handler.failed_ids.lock().expect("failed lock").len(), 1);
        // The original context is untouched.
        assert_eq!(ctx.message_count, 0);
    }
}
