use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use toporia_realtime::broker::{Broker, MemoryBroker};
use toporia_realtime::clock::{ManualClock, SystemClock};
use toporia_realtime::config::ConsumerConfig;
use toporia_realtime::consumer::{
    ConsumerWorker, Handler, HandlerContext, ProcessRecordStore, WorkerStatus,
};
use toporia_realtime::message::Message;
use toporia_realtime::Result;

struct CountingHandler {
    handled: AtomicU64,
    fail_on: Option<serde_json::Value>,
}

impl CountingHandler {
    fn new(fail_on: Option<serde_json::Value>) -> Self {
        Self {
            handled: AtomicU64::new(0),
            fail_on,
        }
    }
}

impl Handler for CountingHandler {
    fn name(&self) -> &str {
        "counting"
    }

    fn channels(&self) -> Vec<String> {
        vec!["orders".to_string()]
    }

    fn handle(&self, msg: &Message, _ctx: &HandlerContext) -> Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if Some(&msg.data) == self.fail_on.as_ref() {
            return Err(toporia_realtime::Error::HandlerFailure(
                "poisoned payload".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batch-aware handler recording batch sizes.
struct BatchHandler {
    batches: Mutex<Vec<usize>>,
}

impl Handler for BatchHandler {
    fn name(&self) -> &str {
        "batchy"
    }
    fn channels(&self) -> Vec<String> {
        vec!["orders".to_string()]
    }
    fn handle(&self, _msg: &Message, _ctx: &HandlerContext) -> Result<()> {
        panic!("batch-aware handler must receive batches");
    }
    fn supports_batch(&self) -> bool {
        true
    }
    fn handle_batch(&self, msgs: &[Message], _ctx: &HandlerContext) -> Vec<usize> {
        self.batches.lock().expect("batches lock").push(msgs.len());
        Vec::new()
    }
}

fn config(max_messages: u64, batch_size: usize) -> ConsumerConfig {
    ConsumerConfig {
        handler: "counting".to_string(),
        driver: "memory".to_string(),
        workers: 1,
        batch_size,
        batch_timeout_ms: 50,
        timeout_ms: 20,
        max_messages,
        memory_limit_mb: 0,
        graceful_timeout_s: 5,
        state_dir: std::env::temp_dir().join("toporia-test-unused"),
    }
}

fn publish(broker: &MemoryBroker, n: usize) {
    for i in 0..n {
        let msg = Message::event("orders", "created", serde_json::json!(i));
        broker.publish("orders", &msg).expect("publish");
    }
}

#[test]
fn worker_stops_at_max_messages_with_counts() {
    let broker = Arc::new(MemoryBroker::new());
    publish(&broker, 10);

    let handler = Arc::new(CountingHandler::new(Some(serde_json::json!(3))));
    let worker = ConsumerWorker::new(
        broker,
        handler.clone(),
        config(10, 4),
        Arc::new(SystemClock),
    );

    let stats = worker.run().expect("worker run");
    assert_eq!(stats.message_count, 10);
    assert_eq!(stats.error_count, 1, "payload 3 fails once");
    assert_eq!(handler.handled.load(Ordering::SeqCst), 10);
}

#[test]
fn batch_aware_handler_gets_whole_batches() {
    let broker = Arc::new(MemoryBroker::new());
    publish(&broker, 8);

    let handler = Arc::new(BatchHandler {
        batches: Mutex::new(Vec::new()),
    });
    let mut cfg = config(8, 4);
    cfg.handler = "batchy".to_string();
    let worker = ConsumerWorker::new(broker, handler.clone(), cfg, Arc::new(SystemClock));

    let stats = worker.run().expect("worker run");
    assert_eq!(stats.message_count, 8);
    let batches = handler.batches.lock().expect("batches lock").clone();
    assert_eq!(batches.iter().sum::<usize>(), 8);
    assert!(batches.iter().all(|size| *size <= 4));
}

#[test]
fn aged_batch_flushes_before_the_size_cap() {
    let broker = Arc::new(MemoryBroker::new());
    publish(&broker, 3);

    let handler = Arc::new(BatchHandler {
        batches: Mutex::new(Vec::new()),
    });
    // batch_size far above the message count: only age can flush.
    let mut cfg = config(3, 100);
    cfg.handler = "batchy".to_string();
    cfg.batch_timeout_ms = 500;

    let clock = ManualClock::new(1_000_000_000);
    let ticker = clock.clone();
    let ticker_thread = std::thread::spawn(move || {
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(20));
            ticker.advance_secs(1);
        }
    });

    let worker = ConsumerWorker::new(broker, handler.clone(), cfg, Arc::new(clock));
    let stats = worker.run().expect("worker run");
    ticker_thread.join().expect("ticker thread");

    assert_eq!(stats.message_count, 3);
    let batches = handler.batches.lock().expect("batches lock").clone();
    assert_eq!(batches, vec![3], "one age-triggered flush below the size cap");
}

#[test]
fn worker_record_tracks_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Arc::new(MemoryBroker::new());
    publish(&broker, 4);

    let handler = Arc::new(CountingHandler::new(None));
    let store = ProcessRecordStore::open(dir.path()).expect("store");
    let worker = ConsumerWorker::new(broker, handler, config(4, 2), Arc::new(SystemClock))
        .with_record_store(store)
        .with_worker_id("w-test");

    worker.run().expect("worker run");

    let store = ProcessRecordStore::open(dir.path()).expect("store");
    let record = store.load("w-test").expect("record");
    assert_eq!(record.status, WorkerStatus::Stopped);
    assert_eq!(record.message_count, 4);
    assert_eq!(record.pid, std::process::id());
    assert!(record.stopped_at_ns.is_some());
    assert!(record.last_heartbeat_ns >= record.started_at_ns);
}
