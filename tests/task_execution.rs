use std::sync::Arc;

use toporia_realtime::config::{TaskConfig, TaskDriver};
use toporia_realtime::task::{
    DeferredTasks, JobRegistry, TaskExecutor, TaskOutcome, WorkUnit,
};

fn jobs() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry.register("one", |_| Ok(serde_json::json!(1)));
    registry.register("throw_x", |_| Err("x".to_string()));
    registry.register("ok", |_| Ok(serde_json::json!("ok")));
    Arc::new(registry)
}

fn config(driver: TaskDriver) -> TaskConfig {
    TaskConfig {
        default_driver: driver,
        max_concurrent: 3,
        timeout_s: 10,
        secret_key: None,
    }
}

#[test]
fn sync_nonstrict_matches_the_documented_shape() {
    // { a: ()->1, b: ()->throw("x"), c: ()->"ok" } in insertion order.
    let executor = TaskExecutor::new(jobs(), config(TaskDriver::Sync));
    let tasks = vec![
        ("a".to_string(), WorkUnit::new("one", serde_json::Value::Null)),
        ("b".to_string(), WorkUnit::new("throw_x", serde_json::Value::Null)),
        ("c".to_string(), WorkUnit::new("ok", serde_json::Value::Null)),
    ];

    let results = executor.run(tasks).expect("run");
    assert_eq!(results.keys(), vec!["a", "b", "c"]);
    assert_eq!(results.get("a"), Some(&TaskOutcome::Value(serde_json::json!(1))));
    match results.get("b").expect("b present") {
        TaskOutcome::Failed { error, exception } => {
            assert_eq!(error, "x");
            assert!(!exception.is_empty());
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        results.get("c"),
        Some(&TaskOutcome::Value(serde_json::json!("ok")))
    );
}

#[test]
fn empty_task_list_is_an_empty_map() {
    let executor = TaskExecutor::new(jobs(), config(TaskDriver::Sync));
    let results = executor.run(Vec::new()).expect("run");
    assert!(results.is_empty());
}

#[cfg(unix)]
mod process_driver {
    use super::*;

    fn sh_executor(script: &str, driver: TaskDriver) -> TaskExecutor {
        TaskExecutor::new(jobs(), config(driver)).with_runner_command(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    #[test]
    fn results_keep_caller_key_order_regardless_of_completion() {
        // Runner sleeps by key so completion order inverts insertion order.
        let script = r#"case "$TOPORIA_TASK_KEY" in a) sleep 0.3;; b) sleep 0.1;; esac; echo "\"$TOPORIA_TASK_KEY\"""#;
        let executor = sh_executor(script, TaskDriver::Process);
        let tasks = vec![
            ("a".to_string(), WorkUnit::new("one", serde_json::Value::Null)),
            ("b".to_string(), WorkUnit::new("one", serde_json::Value::Null)),
            ("c".to_string(), WorkUnit::new("one", serde_json::Value::Null)),
        ];
        let results = executor.run(tasks).expect("run");
        assert_eq!(results.keys(), vec!["a", "b", "c"]);
        assert_eq!(
            results.get("a"),
            Some(&TaskOutcome::Value(serde_json::json!("a")))
        );
    }

    #[test]
    fn empty_stdout_is_a_null_result() {
        let executor = sh_executor("exit 0", TaskDriver::Process);
        let tasks = vec![("k".to_string(), WorkUnit::new("one", serde_json::Value::Null))];
        let results = executor.run(tasks).expect("run");
        assert_eq!(
            results.get("k"),
            Some(&TaskOutcome::Value(serde_json::Value::Null))
        );
    }

    #[test]
    fn nonzero_exit_becomes_a_captured_failure() {
        let executor = sh_executor("echo boom >&2; exit 4", TaskDriver::Process);
        let tasks = vec![("k".to_string(), WorkUnit::new("one", serde_json::Value::Null))];
        let results = executor.run(tasks).expect("run");
        match results.get("k").expect("k present") {
            TaskOutcome::Failed { error, exception } => {
                assert_eq!(error, "boom");
                assert!(exception.contains("TaskFailed"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn garbage_stdout_is_a_deserialization_failure() {
        let executor = sh_executor("echo 'not json at all {'", TaskDriver::Process);
        let tasks = vec![("k".to_string(), WorkUnit::new("one", serde_json::Value::Null))];
        let results = executor.run(tasks).expect("run");
        match results.get("k").expect("k present") {
            TaskOutcome::Failed { error, .. } => {
                assert!(error.starts_with("Failed to deserialize result"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn fork_driver_degrades_to_process() {
        let executor = sh_executor("echo 7", TaskDriver::Fork);
        let tasks = vec![("k".to_string(), WorkUnit::new("one", serde_json::Value::Null))];
        let results = executor.run(tasks).expect("run");
        assert_eq!(
            results.get("k"),
            Some(&TaskOutcome::Value(serde_json::json!(7)))
        );
    }
}

#[test]
fn deferred_tasks_run_on_drain_without_raising() {
    let executor = TaskExecutor::new(jobs(), config(TaskDriver::Sync));
    let deferred = DeferredTasks::new();
    deferred.push("a", WorkUnit::new("one", serde_json::Value::Null));
    deferred.push("b", WorkUnit::new("throw_x", serde_json::Value::Null));
    assert_eq!(deferred.len(), 2);

    // Failures are logged, never raised.
    deferred.drain(&executor);
    assert!(deferred.is_empty());
}
