// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use plinth_common::codec::Value;
use plinth_common::model::{
    AdapterPayload, ArtifactKind, ErrorCode, ExecutionContext, HandlerInvocation,
    HandlerReference,
};
use plinth_sandbox::{ProcessSandboxRunner, Runner, SandboxConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use test_r::test;
use tokio_util::sync::CancellationToken;

test_r::enable!();

fn worker_bin() -> (PathBuf, String) {
    let exe = PathBuf::from(env!("CARGO_BIN_EXE_plinth-test-worker"));
    let root = exe.parent().expect("bin has a parent").to_path_buf();
    let file = exe
        .file_name()
        .expect("bin has a file name")
        .to_string_lossy()
        .into_owned();
    (root, file)
}

struct TestBed {
    _workdir: TempDir,
    crash_dir: TempDir,
    runner: ProcessSandboxRunner,
    invocation: HandlerInvocation,
}

fn testbed(export: &str, input: Value) -> TestBed {
    let (root, file) = worker_bin();
    let workdir = TempDir::new().unwrap();
    let crash_dir = TempDir::new().unwrap();

    let context = ExecutionContext::new(
        "test-plugin",
        "0.0.1",
        root,
        workdir.path(),
        AdapterPayload::Job {
            job_id: "test-job".to_string(),
            scheduled_at: chrono::Utc::now(),
            run_count: 0,
        },
    );

    let config = SandboxConfig {
        memory_poll_interval: Duration::from_millis(100),
        crash_dir: Some(crash_dir.path().to_path_buf()),
        ..SandboxConfig::default()
    };

    TestBed {
        invocation: HandlerInvocation {
            handler: HandlerReference::new(file, export),
            input,
            context,
        },
        runner: ProcessSandboxRunner::new(config),
        _workdir: workdir,
        crash_dir,
    }
}

fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

#[test]
async fn echo_round_trips_rich_values() {
    let input = map(vec![
        ("text", Value::text("hello")),
        ("blob", Value::bytes(vec![1u8, 2, 3])),
        ("when", Value::Timestamp(chrono::Utc::now())),
    ]);
    let bed = testbed("echo", input.clone());
    let result = bed.runner.run(bed.invocation).await;
    assert!(result.ok, "expected success, got {:?}", result.error);
    assert_eq!(result.data, Some(input));
    assert!(result.metrics.wall_ms > 0);
}

#[test]
async fn worker_logs_arrive_in_emission_order() {
    let bed = testbed("chatty", map(vec![("lines", Value::int(5))]));
    let result = bed.runner.run(bed.invocation).await;
    assert!(result.ok);
    let messages: Vec<&str> = result.logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(
        &messages[..5],
        &["line 0", "line 1", "line 2", "line 3", "line 4"]
    );
    let last = result.logs.last().unwrap();
    assert_eq!(last.message, "done");
    assert_eq!(last.meta.as_ref().unwrap()["lines"], 5);
}

#[test]
async fn handler_errors_keep_code_message_and_stack() {
    let bed = testbed("fail", Value::Null);
    let result = bed.runner.run(bed.invocation).await;
    assert!(!result.ok);
    let error = result.error.unwrap();
    assert_eq!(error.code, ErrorCode::HandlerError);
    assert_eq!(error.message, "told to fail");
    assert_eq!(error.stack.as_deref(), Some("at fail (plinth_test_worker)"));
}

#[test]
async fn unknown_export_is_handler_not_found() {
    let bed = testbed("does-not-exist", Value::Null);
    let result = bed.runner.run(bed.invocation).await;
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::HandlerNotFound));
}

#[test]
async fn missing_worker_file_is_handler_not_found() {
    let mut bed = testbed("echo", Value::Null);
    bed.invocation.handler.file = "no-such-worker".to_string();
    let result = bed.runner.run(bed.invocation).await;
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::HandlerNotFound));
}

#[test]
async fn hard_timeout_drains_the_worker() {
    let mut bed = testbed("sleep", map(vec![("ms", Value::int(2000))]));
    bed.invocation.context.limits.timeout_ms = 500;
    bed.invocation.context.limits.grace_ms = 200;
    let started = Instant::now();
    let result = bed.runner.run(bed.invocation).await;
    let elapsed = started.elapsed();
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(2000), "took {elapsed:?}");
}

#[test]
async fn cancellation_drains_with_cancelled() {
    let bed = testbed("sleep", map(vec![("ms", Value::int(5000))]));
    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };
    let result = bed.runner.run_cancellable(bed.invocation, cancel).await;
    trigger.await.unwrap();
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::Cancelled));
}

#[test]
async fn pre_oom_crossing_writes_a_heap_snapshot() {
    let mut bed = testbed(
        "alloc",
        map(vec![("mb", Value::int(175)), ("holdMs", Value::int(1500))]),
    );
    bed.invocation.context.limits.memory_mb = 200;
    bed.invocation.context.limits.timeout_ms = 10_000;
    let result = bed.runner.run(bed.invocation).await;
    assert!(result.ok, "expected success, got {:?}", result.error);
    let snapshot = result
        .artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::HeapSnapshot)
        .expect("pre-OOM diagnostic artifact expected");
    assert!(snapshot.path.exists());
    assert!(snapshot.path.starts_with(bed.crash_dir.path()));
    assert!(result.metrics.mem_mb.unwrap() >= 170);
}

#[test]
async fn exceeding_the_memory_limit_terminates_with_memory() {
    let mut bed = testbed(
        "alloc",
        map(vec![("mb", Value::int(160)), ("holdMs", Value::int(5000))]),
    );
    bed.invocation.context.limits.memory_mb = 100;
    bed.invocation.context.limits.timeout_ms = 10_000;
    bed.invocation.context.limits.grace_ms = 200;
    let result = bed.runner.run(bed.invocation).await;
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::Memory));
}

#[test]
async fn abrupt_exit_writes_a_crash_report() {
    let bed = testbed("quit", map(vec![("code", Value::int(7))]));
    let result = bed.runner.run(bed.invocation).await;
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::UncaughtException));
    assert!(result.error.as_ref().unwrap().message.contains("7"));
    let report = result
        .artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::CrashReport)
        .expect("crash report artifact expected");
    assert!(report.path.exists());
    let raw = std::fs::read_to_string(&report.path).unwrap();
    assert!(raw.contains("\"exit_code\": 7"));
}

#[test]
async fn handler_panic_is_uncaught_exception() {
    let bed = testbed("panic", Value::Null);
    let result = bed.runner.run(bed.invocation).await;
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::UncaughtException));
    assert!(
        result
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("on purpose")
    );
}

#[test]
async fn environment_is_reduced_to_the_allow_list() {
    // Safety: names are unique to this test.
    unsafe {
        std::env::set_var("PLINTH_TEST_ALLOWED", "visible");
        std::env::set_var("PLINTH_TEST_SECRET", "hidden");
    }
    let mut bed = testbed("env-probe", Value::Null);
    bed.invocation.context.permissions.env.allow = vec!["PLINTH_TEST_ALLOWED".to_string()];
    let result = bed.runner.run(bed.invocation).await;
    assert!(result.ok);
    let env = result.data.unwrap();
    let env = env.as_map().unwrap();
    assert_eq!(
        env.get("PLINTH_TEST_ALLOWED"),
        Some(&Value::text("visible"))
    );
    assert!(!env.contains_key("PLINTH_TEST_SECRET"));
}

#[test]
async fn silent_worker_times_out_during_spawn() {
    // Safety: name is unique to this test; the worker only sees it through
    // the allow-list.
    unsafe {
        std::env::set_var("TEST_WORKER_MUTE", "1");
    }
    let (root, file) = worker_bin();
    let workdir = TempDir::new().unwrap();
    let mut context = ExecutionContext::new(
        "test-plugin",
        "0.0.1",
        root,
        workdir.path(),
        AdapterPayload::Job {
            job_id: "mute".to_string(),
            scheduled_at: chrono::Utc::now(),
            run_count: 0,
        },
    );
    context.permissions.env.allow = vec!["TEST_WORKER_MUTE".to_string()];
    context.limits.grace_ms = 100;
    let runner = ProcessSandboxRunner::new(SandboxConfig {
        spawn_timeout: Duration::from_millis(400),
        ..SandboxConfig::default()
    });
    let result = runner
        .run(HandlerInvocation {
            handler: HandlerReference::new(file, "echo"),
            input: Value::Null,
            context,
        })
        .await;
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::SpawnTimeout));
}

#[test]
async fn nonzero_cli_return_value_is_an_exit_code() {
    let mut bed = testbed("main", Value::Null);
    bed.invocation.context.adapter = AdapterPayload::Cli {
        argv: vec!["4".to_string()],
        flags: BTreeMap::new(),
    };
    let result = bed.runner.run(bed.invocation).await;
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::HandlerExitCode));
    assert_eq!(result.data, Some(Value::int(4)));

    let mut bed = testbed("main", Value::Null);
    bed.invocation.context.adapter = AdapterPayload::Cli {
        argv: vec!["0".to_string()],
        flags: BTreeMap::new(),
    };
    let result = bed.runner.run(bed.invocation).await;
    assert!(result.ok, "zero exit code is success: {:?}", result.error);
}

#[test]
async fn dispose_rejects_new_invocations() {
    let bed = testbed("echo", Value::Null);
    bed.runner.dispose().await;
    let result = bed.runner.run(bed.invocation).await;
    assert!(!result.ok);
    assert_eq!(result.error_code(), Some(ErrorCode::Cancelled));
}

#[test]
async fn debug_invocations_write_a_trace_file() {
    let mut bed = testbed("chatty", map(vec![("lines", Value::int(1))]));
    bed.invocation.context.debug = true;
    let result = bed.runner.run(bed.invocation).await;
    assert!(result.ok);
    let trace = result
        .artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::TraceFile)
        .expect("trace artifact expected in debug mode");
    let rows: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&trace.path).unwrap()).unwrap();
    assert!(rows.iter().any(|r| r["name"] == "spawn"));
    assert!(rows.iter().any(|r| r["name"] == "run"));
}
