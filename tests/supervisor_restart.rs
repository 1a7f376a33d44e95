#![cfg(unix)]

use std::process::{Child, Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use toporia_realtime::clock::SystemClock;
use toporia_realtime::config::ConsumerConfig;
use toporia_realtime::consumer::{ProcessRecordStore, Supervisor, WorkerLauncher};
use toporia_realtime::error::Result;

/// Launches inert children so the test exercises only supervision.
struct SleepLauncher;

impl WorkerLauncher for SleepLauncher {
    fn launch(&self, _index: u32, _worker_id: &str) -> Result<Child> {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?;
        Ok(child)
    }
}

fn config(dir: &std::path::Path, workers: u32) -> ConsumerConfig {
    ConsumerConfig {
        handler: "log".to_string(),
        driver: "memory".to_string(),
        workers,
        graceful_timeout_s: 5,
        state_dir: dir.to_path_buf(),
        ..ConsumerConfig::default()
    }
}

fn running_pids(store: &ProcessRecordStore) -> Vec<u32> {
    store
        .list()
        .expect("list records")
        .into_iter()
        .filter(|r| r.stopped_at_ns.is_none())
        .map(|r| r.pid)
        .collect()
}

#[test]
fn killed_worker_is_reaped_and_respawned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor = Supervisor::new(config(dir.path(), 3), Arc::new(SystemClock))
        .expect("supervisor");
    let shutdown = supervisor.shutdown_handle();

    let handle = std::thread::spawn(move || supervisor.run(&SleepLauncher));

    let store = ProcessRecordStore::open(dir.path()).expect("store");

    // Wait for three live workers.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut pids = Vec::new();
    while Instant::now() < deadline {
        pids = running_pids(&store);
        if pids.len() == 3 {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(pids.len(), 3, "expected 3 seeded workers");

    // SIGKILL one worker and wait for the replacement.
    let victim = pids[1];
    unsafe {
        libc::kill(victim as libc::pid_t, libc::SIGKILL);
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut respawned = false;
    while Instant::now() < deadline {
        let now_running = running_pids(&store);
        if now_running.len() == 3 && !now_running.contains(&victim) {
            respawned = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(respawned, "victim was not replaced");

    shutdown.store(true, Ordering::SeqCst);
    let stats = handle
        .join()
        .expect("supervisor thread")
        .expect("supervisor run");

    // Every fork was reaped: 3 initial + 1 replacement.
    assert_eq!(stats.spawned, 4);
    assert_eq!(stats.reaped, 4);
    assert_eq!(stats.restarts, 1);
}

#[test]
fn scaled_mode_requires_at_least_two_workers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor =
        Supervisor::new(config(dir.path(), 1), Arc::new(SystemClock)).expect("supervisor");
    assert!(supervisor.run(&SleepLauncher).is_err());
}
