//! Master process supervising a pool of consumer workers.
//!
//! Workers are separate OS processes launched by re-executing the current
//! binary in single-worker mode. The master reaps exits non-blockingly,
//! restarts crashed workers after a one-second back-off, watches heartbeats
//! through the shared record store, and shuts the pool down gracefully on
//! SIGTERM/SIGINT.

use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::ConsumerConfig;
use crate::consumer::records::{hostname, ProcessRecordStore, WorkerRecord, WorkerStatus};
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(10);
const HEARTBEAT_TIMEOUT_NS: u64 = 30 * 1_000_000_000;

/// Worker id handed to spawned children.
pub const WORKER_ID_ENV: &str = "TOPORIA_WORKER_ID";

static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_term_signal(_sig: libc::c_int) {
    TERM_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
extern "C" fn on_chld_signal(_sig: libc::c_int) {
    // Only a flag: the main loop reaps with try_wait, so SIGCHLD may land
    // at any point without corrupting state.
    CHILD_EXITED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, on_term_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_term_signal as libc::sighandler_t);
        libc::signal(libc::SIGCHLD, on_chld_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// Spawns one worker process. Split from the supervisor so tests can
/// substitute inert children.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, index: u32, worker_id: &str) -> Result<Child>;
}

/// Re-executes the current binary in single-worker mode.
pub struct ExecLauncher {
    config: ConsumerConfig,
}

impl ExecLauncher {
    pub fn new(config: ConsumerConfig) -> Self {
        Self { config }
    }
}

impl WorkerLauncher for ExecLauncher {
    fn launch(&self, index: u32, worker_id: &str) -> Result<Child> {
        let exe = std::env::current_exe()?;
        let cfg = &self.config;
        let mut cmd = Command::new(exe);
        cmd.arg("broker:consume-scaled")
            .arg("--handler")
            .arg(&cfg.handler)
            .arg("--driver")
            .arg(&cfg.driver)
            .arg("--workers")
            .arg("1")
            .arg("--batch-size")
            .arg(cfg.batch_size.to_string())
            .arg("--batch-timeout")
            .arg(cfg.batch_timeout_ms.to_string())
            .arg("--timeout")
            .arg(cfg.timeout_ms.to_string())
            .arg("--max-messages")
            .arg(cfg.max_messages.to_string())
            .arg("--memory-limit")
            .arg(cfg.memory_limit_mb.to_string())
            .arg("--graceful-timeout")
            .arg(cfg.graceful_timeout_s.to_string())
            .arg("--state-dir")
            .arg(&cfg.state_dir)
            .env(WORKER_ID_ENV, worker_id)
            .stdin(Stdio::null());
        log::debug!("launching worker {index} as {worker_id}");
        Ok(cmd.spawn()?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub spawned: u64,
    pub reaped: u64,
    pub restarts: u64,
}

struct Slot {
    index: u32,
    worker_id: String,
    child: Option<Child>,
    respawn_at: Option<Instant>,
}

pub struct Supervisor {
    config: ConsumerConfig,
    store: ProcessRecordStore,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: ConsumerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = ProcessRecordStore::open(&config.state_dir)?;
        Ok(Self {
            config,
            store,
            clock,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Programmatic equivalent of SIGTERM, for embedding and tests.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || TERM_REQUESTED.load(Ordering::SeqCst)
    }

    /// Run the master loop until a shutdown request.
    pub fn run(&self, launcher: &dyn WorkerLauncher) -> Result<SupervisorStats> {
        if self.config.workers < 2 {
            return Err(Error::Fatal(
                "scaled supervision needs at least 2 workers".to_string(),
            ));
        }
        install_signal_handlers();
        TERM_REQUESTED.store(false, Ordering::SeqCst);

        let mut stats = SupervisorStats::default();
        let mut slots: Vec<Slot> = (0..self.config.workers)
            .map(|index| Slot {
                index,
                worker_id: String::new(),
                child: None,
                respawn_at: None,
            })
            .collect();
        for slot in &mut slots {
            self.spawn_into(slot, launcher, &mut stats)?;
        }
        log::info!(
            "supervising {} workers for handler '{}'",
            slots.len(),
            self.config.handler
        );

        let mut last_stats_at = Instant::now();
        while !self.shutting_down() {
            CHILD_EXITED.store(false, Ordering::SeqCst);

            for slot in &mut slots {
                self.poll_slot(slot, &mut stats);
            }
            for slot in &mut slots {
                let due = slot
                    .respawn_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(false);
                if due && !self.shutting_down() {
                    slot.respawn_at = None;
                    stats.restarts += 1;
                    if let Err(err) = self.spawn_into(slot, launcher, &mut stats) {
                        log::error!("cannot respawn worker {}: {err}", slot.index);
                        slot.respawn_at = Some(Instant::now() + RESTART_BACKOFF);
                    }
                }
            }

            if last_stats_at.elapsed() >= STATS_INTERVAL {
                last_stats_at = Instant::now();
                self.emit_stats(&slots, &stats);
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        self.graceful_shutdown(&mut slots, &mut stats);
        Ok(stats)
    }

    fn spawn_into(
        &self,
        slot: &mut Slot,
        launcher: &dyn WorkerLauncher,
        stats: &mut SupervisorStats,
    ) -> Result<()> {
        let worker_id = uuid::Uuid::new_v4().to_string();
        let child = launcher.launch(slot.index, &worker_id)?;
        let now = self.clock.now_ns();

        // Seed the record so status tooling sees the worker before its
        // first own heartbeat.
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("worker_index".to_string(), slot.index.to_string());
        let record = WorkerRecord {
            id: worker_id.clone(),
            handler_name: self.config.handler.clone(),
            driver: self.config.driver.clone(),
            pid: child.id(),
            hostname: hostname(),
            channels: Vec::new(),
            status: WorkerStatus::Starting,
            started_at_ns: now,
            last_heartbeat_ns: now,
            stopped_at_ns: None,
            message_count: 0,
            error_count: 0,
            metadata,
        };
        if let Err(err) = self.store.save(&record) {
            log::warn!("cannot seed worker record {worker_id}: {err}");
        }

        slot.worker_id = worker_id;
        slot.child = Some(child);
        stats.spawned += 1;
        Ok(())
    }

    /// Reap an exited child or kill one whose heartbeat went stale.
    fn poll_slot(&self, slot: &mut Slot, stats: &mut SupervisorStats) {
        let Some(child) = slot.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                stats.reaped += 1;
                let code = status.code();
                let clean = code == Some(0);
                log::warn!(
                    "worker {} (slot {}) exited with {:?}",
                    slot.worker_id,
                    slot.index,
                    code
                );
                self.mark_stopped(
                    &slot.worker_id,
                    if clean {
                        WorkerStatus::Stopped
                    } else {
                        WorkerStatus::Failed
                    },
                );
                slot.child = None;
                slot.respawn_at = Some(Instant::now() + RESTART_BACKOFF);
            }
            Ok(None) => {
                // Still running: verify liveness through the heartbeat.
                if let Ok(record) = self.store.load(&slot.worker_id) {
                    let now = self.clock.now_ns();
                    if record.status == WorkerStatus::Running
                        && !record.heartbeat_alive(now, HEARTBEAT_TIMEOUT_NS)
                    {
                        log::warn!(
                            "worker {} heartbeat stale, killing pid {}",
                            slot.worker_id,
                            record.pid
                        );
                        let _ = child.kill();
                    }
                }
            }
            Err(err) => {
                log::error!("try_wait failed for worker {}: {err}", slot.worker_id);
            }
        }
    }

    fn graceful_shutdown(&self, slots: &mut [Slot], stats: &mut SupervisorStats) {
        log::info!("supervisor shutting down, signalling workers");
        for slot in slots.iter_mut() {
            if let Some(child) = &slot.child {
                send_sigterm(child.id());
                self.mark_status(&slot.worker_id, WorkerStatus::Stopping);
            }
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.graceful_timeout_s);
        loop {
            let mut alive = 0;
            for slot in slots.iter_mut() {
                if let Some(child) = slot.child.as_mut() {
                    match child.try_wait() {
                        Ok(Some(_)) => {
                            stats.reaped += 1;
                            self.mark_stopped(&slot.worker_id, WorkerStatus::Stopped);
                            slot.child = None;
                        }
                        Ok(None) => alive += 1,
                        Err(_) => {
                            slot.child = None;
                        }
                    }
                }
            }
            if alive == 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        // Survivors get SIGKILL.
        for slot in slots.iter_mut() {
            if let Some(child) = slot.child.as_mut() {
                log::warn!("worker {} ignored SIGTERM, killing", slot.worker_id);
                let _ = child.kill();
                let _ = child.wait();
                stats.reaped += 1;
                self.mark_stopped(&slot.worker_id, WorkerStatus::Failed);
                slot.child = None;
            }
        }
        log::info!(
            "supervisor stopped: spawned={} reaped={} restarts={}",
            stats.spawned,
            stats.reaped,
            stats.restarts
        );
    }

    fn emit_stats(&self, slots: &[Slot], stats: &SupervisorStats) {
        let active = slots.iter().filter(|s| s.child.is_some()).count();
        let (messages, errors) = slots
            .iter()
            .filter_map(|s| self.store.load(&s.worker_id).ok())
            .fold((0u64, 0u64), |(m, e), r| {
                (m + r.message_count, e + r.error_count)
            });
        log::info!(
            "Workers: {active} active | restarts: {} | messages: {messages} | errors: {errors}",
            stats.restarts
        );
    }

    fn mark_status(&self, worker_id: &str, status: WorkerStatus) {
        if let Ok(mut record) = self.store.load(worker_id) {
            record.status = status;
            let _ = self.store.save(&record);
        }
    }

    fn mark_stopped(&self, worker_id: &str, status: WorkerStatus) {
        if let Ok(mut record) = self.store.load(worker_id) {
            record.status = status;
            record.stopped_at_ns = Some(self.clock.now_ns());
            let _ = self.store.save(&record);
        }
    }
}
