//! Runner-side entry point for spawned work units.
//!
//! The parent hands the envelope and key over environment variables; the
//! runner verifies, executes, and serializes the result to stdout. Exit
//! codes: 0 success, 1 job failure, 2 bad or missing envelope.

use crate::task::{decode_envelope, JobRegistry, CLOSURE_ENV, SECRET_ENV, TASK_KEY_ENV};

/// Execute the work unit described by the environment. Returns the process
/// exit code; the caller passes it to `std::process::exit`.
pub fn run_from_env(registry: &JobRegistry) -> i32 {
    let Ok(raw) = std::env::var(CLOSURE_ENV) else {
        eprintln!("{CLOSURE_ENV} is not set");
        return 2;
    };
    let secret = std::env::var(SECRET_ENV).ok();

    let (unit, envelope_key) = match decode_envelope(&raw, secret.as_deref()) {
        Ok(decoded) => decoded,
        Err(err) => {
            eprintln!("rejecting work unit: {err}");
            return 2;
        }
    };

    if let Ok(task_key) = std::env::var(TASK_KEY_ENV) {
        if task_key != envelope_key {
            eprintln!("key mismatch: env '{task_key}' vs envelope '{envelope_key}'");
            return 2;
        }
    }

    let Some(job) = registry.resolve(&unit.job) else {
        eprintln!("unknown job '{}'", unit.job);
        return 1;
    };

    match job(unit.args) {
        Ok(value) => {
            println!("{value}");
            0
        }
        Err(error) => {
            eprintln!("{error}");
            1
        }
    }
}
