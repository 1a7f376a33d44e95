//! Out-of-process task execution.
//!
//! Work units are typed: callers register named jobs at startup and ship
//! `{job, args}` envelopes, so no code ever crosses a process boundary.
//! Envelopes are base64-encoded and optionally signed with a keyed blake3
//! hash; verification failure aborts execution before the job is looked up.

pub mod pool;
pub mod runner;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::{TaskConfig, TaskDriver};
use crate::error::{Error, Result};

pub use pool::{PoolOutcome, PoolTask, ProcessPool};

/// Env var carrying the encoded work-unit envelope.
pub const CLOSURE_ENV: &str = "TOPORIA_INVOKABLE_CLOSURE";
/// Env var carrying the work-unit key.
pub const TASK_KEY_ENV: &str = "TOPORIA_TASK_KEY";
/// Env var carrying the signing secret for spawned runners.
pub const SECRET_ENV: &str = "TOPORIA_TASK_SECRET";

pub type JobResult = std::result::Result<serde_json::Value, String>;
pub type JobFn = Arc<dyn Fn(serde_json::Value) -> JobResult + Send + Sync>;

/// Name -> job mapping, built once at startup.
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, JobFn>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value) -> JobResult + Send + Sync + 'static,
    {
        self.jobs.insert(name.into(), Arc::new(f));
    }

    pub fn resolve(&self, name: &str) -> Option<JobFn> {
        self.jobs.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }
}

/// One unit of work: a registered job name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub job: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl WorkUnit {
    pub fn new(job: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            job: job.into(),
            args,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct EnvelopeBody {
    job: String,
    args: serde_json::Value,
    key: String,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

fn signing_key(secret: &str) -> [u8; 32] {
    *blake3::hash(secret.as_bytes()).as_bytes()
}

fn sign(payload: &str, secret: &str) -> String {
    blake3::keyed_hash(&signing_key(secret), payload.as_bytes())
        .to_hex()
        .to_string()
}

/// Encode a work unit for the runner env var.
pub fn encode_envelope(unit: &WorkUnit, key: &str, secret: Option<&str>) -> Result<String> {
    let body = EnvelopeBody {
        job: unit.job.clone(),
        args: unit.args.clone(),
        key: key.to_string(),
    };
    let payload = BASE64.encode(serde_json::to_vec(&body)?);
    let envelope = Envelope {
        signature: secret.map(|s| sign(&payload, s)),
        payload,
    };
    Ok(BASE64.encode(serde_json::to_vec(&envelope)?))
}

/// Decode and verify a runner envelope.
pub fn decode_envelope(raw: &str, secret: Option<&str>) -> Result<(WorkUnit, String)> {
    let envelope_bytes = BASE64
        .decode(raw)
        .map_err(|e| Error::SerializationFailed(format!("bad envelope base64: {e}")))?;
    let envelope: Envelope = serde_json::from_slice(&envelope_bytes)
        .map_err(|e| Error::SerializationFailed(format!("bad envelope: {e}")))?;

    if let Some(secret) = secret {
        let valid = envelope
            .signature
            .as_deref()
            .map(|sig| sig == sign(&envelope.payload, secret))
            .unwrap_or(false);
        if !valid {
            return Err(Error::SignatureInvalid);
        }
    }

    let body_bytes = BASE64
        .decode(&envelope.payload)
        .map_err(|e| Error::SerializationFailed(format!("bad payload base64: {e}")))?;
    let body: EnvelopeBody = serde_json::from_slice(&body_bytes)
        .map_err(|e| Error::SerializationFailed(format!("bad payload: {e}")))?;
    Ok((WorkUnit::new(body.job, body.args), body.key))
}

/// Result of one work unit. Failures carry the error text and a class tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskOutcome {
    Failed { error: String, exception: String },
    Value(serde_json::Value),
}

impl TaskOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }
}

/// Results keyed by task key, in task insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskResults {
    entries: Vec<(String, TaskOutcome)>,
}

impl TaskResults {
    pub fn get(&self, key: &str) -> Option<&TaskOutcome> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, outcome)| outcome)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskOutcome)> {
        self.entries.iter().map(|(k, o)| (k.as_str(), o))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for TaskResults {
    type Item = (String, TaskOutcome);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

pub struct TaskExecutor {
    registry: Arc<JobRegistry>,
    config: TaskConfig,
    /// Program plus arguments for the runner child.
    runner_command: Vec<String>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<JobRegistry>, config: TaskConfig) -> Self {
        let default_runner = std::env::current_exe()
            .ok()
            .and_then(|p| p.to_str().map(str::to_string))
            .map(|exe| vec![exe, "task:run".to_string()])
            .unwrap_or_default();
        Self {
            registry,
            config,
            runner_command: default_runner,
        }
    }

    pub fn with_runner_command(mut self, command: Vec<String>) -> Self {
        self.runner_command = command;
        self
    }

    /// Run all tasks with the configured driver, capturing failures into
    /// the result map.
    pub fn run(&self, tasks: Vec<(String, WorkUnit)>) -> Result<TaskResults> {
        match self.config.default_driver {
            TaskDriver::Sync => self.run_sync(tasks, false),
            TaskDriver::Process => self.run_process(tasks),
            TaskDriver::Fork => {
                // Fork buys nothing over spawn for a native runner; degrade.
                log::debug!("fork driver degrades to process isolation");
                self.run_process(tasks)
            }
        }
    }

    /// Sequential execution in this process under a shared wall-clock
    /// budget. With `strict`, the first failure aborts the whole call.
    pub fn run_sync(&self, tasks: Vec<(String, WorkUnit)>, strict: bool) -> Result<TaskResults> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_s);
        let mut results = TaskResults::default();

        for (key, unit) in tasks {
            if Instant::now() >= deadline {
                let outcome = TaskOutcome::Failed {
                    error: format!("shared budget of {}s exhausted", self.config.timeout_s),
                    exception: "TimeoutExceeded".to_string(),
                };
                if strict {
                    return Err(Error::TaskFailed {
                        key,
                        reason: "shared timeout budget exhausted".to_string(),
                        exit_code: None,
                    });
                }
                results.entries.push((key, outcome));
                continue;
            }

            let outcome = match self.registry.resolve(&unit.job) {
                Some(job) => match job(unit.args) {
                    Ok(value) => TaskOutcome::Value(value),
                    Err(error) => TaskOutcome::Failed {
                        error,
                        exception: "JobError".to_string(),
                    },
                },
                None => TaskOutcome::Failed {
                    error: format!("unknown job '{}'", unit.job),
                    exception: "JobNotRegistered".to_string(),
                },
            };

            if strict {
                if let TaskOutcome::Failed { error, .. } = &outcome {
                    return Err(Error::TaskFailed {
                        key,
                        reason: error.clone(),
                        exit_code: None,
                    });
                }
            }
            results.entries.push((key, outcome));
        }
        Ok(results)
    }

    /// One runner process per work unit, concurrency-capped, results
    /// restored to caller key order.
    pub fn run_process(&self, tasks: Vec<(String, WorkUnit)>) -> Result<TaskResults> {
        if self.runner_command.is_empty() {
            return Err(Error::Fatal("no runner command configured".to_string()));
        }
        let secret = self.config.secret_key.as_deref();

        let mut pool_tasks = Vec::with_capacity(tasks.len());
        for (key, unit) in &tasks {
            let encoded = encode_envelope(unit, key, secret)?;
            let mut command = std::process::Command::new(&self.runner_command[0]);
            command.args(&self.runner_command[1..]);
            command.env(CLOSURE_ENV, encoded).env(TASK_KEY_ENV, key);
            if let Some(secret) = secret {
                command.env(SECRET_ENV, secret);
            }
            pool_tasks.push(PoolTask {
                key: key.clone(),
                command,
            });
        }

        let pool = ProcessPool::new(
            self.config.max_concurrent,
            Duration::from_secs(self.config.timeout_s),
        );
        let outcomes = pool.run(pool_tasks)?;

        let mut results = TaskResults::default();
        for outcome in outcomes {
            let key = outcome.key.clone();
            results.entries.push((key, interpret_outcome(outcome)));
        }
        Ok(results)
    }
}

fn interpret_outcome(outcome: PoolOutcome) -> TaskOutcome {
    if let Some(err) = outcome.spawn_error {
        return TaskOutcome::Failed {
            error: format!("cannot spawn runner: {err}"),
            exception: "TaskFailed".to_string(),
        };
    }
    if outcome.timed_out {
        return TaskOutcome::Failed {
            error: "task exceeded its timeout".to_string(),
            exception: "TimeoutExceeded".to_string(),
        };
    }
    match outcome.exit_code {
        Some(0) => {
            let stdout = String::from_utf8_lossy(&outcome.stdout);
            let trimmed = stdout.trim();
            if trimmed.is_empty() {
                // Empty stdout means a null result.
                TaskOutcome::Value(serde_json::Value::Null)
            } else {
                match serde_json::from_str(trimmed) {
                    Ok(value) => TaskOutcome::Value(value),
                    Err(err) => TaskOutcome::Failed {
                        error: format!("Failed to deserialize result: {err}"),
                        exception: "SerializationFailed".to_string(),
                    },
                }
            }
        }
        code => TaskOutcome::Failed {
            error: String::from_utf8_lossy(&outcome.stderr).trim().to_string(),
            exception: format!("TaskFailed(exit={code:?})"),
        },
    }
}

/// Explicit after-response queue for deferred tasks. The request layer
/// drains it once its own output is flushed; errors are logged, not raised.
#[derive(Default)]
pub struct DeferredTasks {
    queue: Mutex<Vec<(String, WorkUnit)>>,
}

impl DeferredTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, key: impl Into<String>, unit: WorkUnit) {
        self.queue
            .lock()
            .expect("deferred queue lock")
            .push((key.into(), unit));
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("deferred queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run everything queued; best-effort.
    pub fn drain(&self, executor: &TaskExecutor) {
        let tasks = std::mem::take(&mut *self.queue.lock().expect("deferred queue lock"));
        if tasks.is_empty() {
            return;
        }
        match executor.run(tasks) {
            Ok(results) => {
                for (key, outcome) in results.iter() {
                    if let TaskOutcome::Failed { error, .. } = outcome {
                        log::error!("deferred task '{key}' failed: {error}");
                    }
                }
            }
            Err(err) => log::error!("deferred task batch failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register("double", |args| {
            let n = args.as_i64().ok_or("args must be a number")?;
            Ok(serde_json::json!(n * 2))
        });
        registry.register("boom", |_| Err("x".to_string()));
        Arc::new(registry)
    }

    fn sync_executor() -> TaskExecutor {
        TaskExecutor::new(
            registry(),
            TaskConfig {
                default_driver: TaskDriver::Sync,
                max_concurrent: 2,
                timeout_s: 30,
                secret_key: None,
            },
        )
    }

    #[test]
    fn sync_nonstrict_captures_failures_in_order() {
        let tasks = vec![
            ("a".to_string(), WorkUnit::new("double", serde_json::json!(1))),
            ("b".to_string(), WorkUnit::new("boom", serde_json::Value::Null)),
            ("c".to_string(), WorkUnit::new("double", serde_json::json!(21))),
        ];
        let results = sync_executor().run_sync(tasks, false).expect("run");
        assert_eq!(results.keys(), vec!["a", "b", "c"]);
        assert_eq!(
            results.get("a"),
            Some(&TaskOutcome::Value(serde_json::json!(2)))
        );
        assert_eq!(
            results.get("b"),
            Some(&TaskOutcome::Failed {
                error: "x".to_string(),
                exception: "JobError".to_string(),
            })
        );
        assert_eq!(
            results.get("c"),
            Some(&TaskOutcome::Value(serde_json::json!(42)))
        );
    }

    #[test]
    fn sync_strict_raises_on_first_failure() {
        let tasks = vec![
            ("a".to_string(), WorkUnit::new("double", serde_json::json!(1))),
            ("b".to_string(), WorkUnit::new("boom", serde_json::Value::Null)),
        ];
        let err = sync_executor().run_sync(tasks, true).expect_err("strict");
        assert!(matches!(err, Error::TaskFailed { key, .. } if key == "b"));
    }

    #[test]
    fn empty_task_list_returns_empty_map() {
        let results = sync_executor().run_sync(Vec::new(), false).expect("run");
        assert!(results.is_empty());
    }

    #[test]
    fn envelope_round_trip_with_signature() {
        let unit = WorkUnit::new("double", serde_json::json!(5));
        let encoded = encode_envelope(&unit, "k1", Some("s3cret")).expect("encode");
        let (decoded, key) = decode_envelope(&encoded, Some("s3cret")).expect("decode");
        assert_eq!(decoded, unit);
        assert_eq!(key, "k1");
    }

    #[test]
    fn tampered_envelope_is_rejected() {
        let unit = WorkUnit::new("double", serde_json::json!(5));
        let encoded = encode_envelope(&unit, "k1", Some("s3cret")).expect("encode");
        assert!(matches!(
            decode_envelope(&encoded, Some("other")),
            Err(Error::SignatureInvalid)
        ));

        // Unsigned envelope against a configured secret is also rejected.
        let unsigned = encode_envelope(&unit, "k1", None).expect("encode");
        assert!(matches!(
            decode_envelope(&unsigned, Some("s3cret")),
            Err(Error::SignatureInvalid)
        ));
    }
}
