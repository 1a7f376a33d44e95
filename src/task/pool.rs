//! Bounded process pool.
//!
//! Spawns child processes up to a concurrency cap, reads their pipes
//! non-blockingly on a 5 ms poll, and enforces per-task wall-clock
//! timeouts (SIGTERM, 10 ms grace, SIGKILL). Results come back in task
//! insertion order, never completion order.

use std::collections::VecDeque;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const KILL_GRACE: Duration = Duration::from_millis(10);

pub struct PoolTask {
    pub key: String,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOutcome {
    pub key: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// None when the child died on a signal or never spawned.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub spawn_error: Option<String>,
}

struct Running {
    index: usize,
    key: String,
    child: Child,
    started: Instant,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    terminated: bool,
}

pub struct ProcessPool {
    max_concurrent: usize,
    task_timeout: Duration,
}

impl ProcessPool {
    pub fn new(max_concurrent: usize, task_timeout: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            task_timeout,
        }
    }

    /// Run every task to completion, timeout, or spawn failure.
    pub fn run(&self, tasks: Vec<PoolTask>) -> Result<Vec<PoolOutcome>> {
        let total = tasks.len();
        let mut results: Vec<Option<PoolOutcome>> = (0..total).map(|_| None).collect();
        let mut queue: VecDeque<(usize, PoolTask)> = tasks.into_iter().enumerate().collect();
        let mut running: Vec<Running> = Vec::new();

        while !queue.is_empty() || !running.is_empty() {
            while running.len() < self.max_concurrent {
                let Some((index, mut task)) = queue.pop_front() else {
                    break;
                };
                task.command
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                match task.command.spawn() {
                    Ok(child) => {
                        set_pipes_nonblocking(&child);
                        running.push(Running {
                            index,
                            key: task.key,
                            child,
                            started: Instant::now(),
                            stdout: Vec::new(),
                            stderr: Vec::new(),
                            terminated: false,
                        });
                    }
                    Err(err) => {
                        results[index] = Some(PoolOutcome {
                            key: task.key,
                            stdout: Vec::new(),
                            stderr: Vec::new(),
                            exit_code: None,
                            timed_out: false,
                            spawn_error: Some(err.to_string()),
                        });
                    }
                }
            }

            let mut still_running = Vec::new();
            for mut run in running {
                drain_pipes(&mut run);
                match run.child.try_wait() {
                    Ok(Some(status)) => {
                        drain_pipes(&mut run);
                        results[run.index] = Some(PoolOutcome {
                            key: run.key,
                            stdout: run.stdout,
                            stderr: run.stderr,
                            exit_code: status.code(),
                            timed_out: run.terminated,
                            spawn_error: None,
                        });
                    }
                    Ok(None) => {
                        if !run.terminated && run.started.elapsed() >= self.task_timeout {
                            log::warn!("task '{}' timed out, terminating", run.key);
                            terminate(&mut run.child);
                            run.terminated = true;
                        }
                        still_running.push(run);
                    }
                    Err(err) => {
                        log::error!("wait failed for task '{}': {err}", run.key);
                        results[run.index] = Some(PoolOutcome {
                            key: run.key,
                            stdout: run.stdout,
                            stderr: run.stderr,
                            exit_code: None,
                            timed_out: run.terminated,
                            spawn_error: Some(err.to_string()),
                        });
                    }
                }
            }
            running = still_running;

            if !running.is_empty() {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

/// SIGTERM, a short grace period, then SIGKILL.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    std::thread::sleep(KILL_GRACE);
    if matches!(child.try_wait(), Ok(None)) {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    std::thread::sleep(KILL_GRACE);
    let _ = child.kill();
}

#[cfg(unix)]
fn set_pipes_nonblocking(child: &Child) {
    use std::os::unix::io::AsRawFd;
    if let Some(out) = &child.stdout {
        set_nonblocking(out.as_raw_fd());
    }
    if let Some(err) = &child.stderr {
        set_nonblocking(err.as_raw_fd());
    }
}

#[cfg(unix)]
fn set_nonblocking(fd: libc::c_int) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

#[cfg(not(unix))]
fn set_pipes_nonblocking(_child: &Child) {}

/// Pull whatever the child has written so far without blocking.
fn drain_pipes(run: &mut Running) {
    if let Some(out) = run.child.stdout.as_mut() {
        read_available(out, &mut run.stdout);
    }
    if let Some(err) = run.child.stderr.as_mut() {
        read_available(err, &mut run.stderr);
    }
}

fn read_available(pipe: &mut impl Read, buf: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}
