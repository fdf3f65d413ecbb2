//! End-to-end executions through real compilers and interpreters.
//!
//! Each test is skipped when its toolchain is not installed.

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use dcode_runner::config::{ExecutionConfig, MegaByte, MilliSecond, SandboxConfig};
use dcode_runner::error::FailureKind;
use dcode_runner::languages::LanguageRegistry;
use dcode_runner::results::{ExecutionResult, ExecutionStatus};
use dcode_runner::sandbox::create_sandbox_runner;
use dcode_runner::scheduler::{Scheduler, SubmitRequest};
use dcode_runner::worker::worker;

fn installed(program: &str) -> bool {
    let found = Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success());
    if !found {
        eprintln!("{program} not found, skipping");
    }
    found
}

/// Runs one submission through the scheduler, a worker and the process runner
async fn execute(
    execution: ExecutionConfig,
    language_id: &str,
    code: &str,
    stdin: Option<&str>,
) -> ExecutionResult {
    let root = tempfile::tempdir().unwrap();
    let runner = create_sandbox_runner(&SandboxConfig {
        work_root: Some(root.path().to_path_buf()),
        ..SandboxConfig::default()
    })
    .unwrap();
    let scheduler = Arc::new(Scheduler::new(LanguageRegistry::builtin(), execution));
    let shutdown = CancellationToken::new();

    let mut workers = JoinSet::new();
    workers.spawn(worker(
        1,
        scheduler.clone(),
        runner,
        shutdown.clone(),
        CancellationToken::new(),
    ));

    let submission_id = scheduler
        .submit(SubmitRequest {
            language_id: language_id.to_string(),
            code: code.to_string(),
            stdin: stdin.map(str::to_string),
            client_id: "toolchain-tests".to_string(),
        })
        .unwrap();
    let result = scheduler
        .wait_result(&submission_id, Duration::from_secs(60))
        .await
        .unwrap();

    shutdown.cancel();
    while let Some(res) = workers.join_next().await {
        res.unwrap().unwrap();
    }
    // Nothing is left behind in the work root
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    result
}

fn config() -> ExecutionConfig {
    ExecutionConfig {
        max_concurrent_slots: 1,
        default_wall_clock_ms: MilliSecond(2000),
        ..ExecutionConfig::default()
    }
}

#[tokio::test]
async fn test_python_hello() {
    if !installed("python3") {
        return;
    }
    let result = execute(config(), "python", "print('hi')", None).await;
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.truncated);
}

#[tokio::test]
async fn test_python_reads_stdin() {
    if !installed("python3") {
        return;
    }
    let code = "import sys\nprint(sum(int(x) for x in sys.stdin.read().split()))";
    let result = execute(config(), "python", code, Some("1 2 3\n4\n")).await;
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.stdout, "10\n");
}

#[tokio::test]
async fn test_python_exception_is_runtime_failure() {
    if !installed("python3") {
        return;
    }
    let result = execute(config(), "python", "raise ValueError('boom')", None).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failure, Some(FailureKind::RuntimeFailed));
    assert_eq!(result.exit_code, Some(1));
    assert!(result.stderr.contains("ValueError: boom"), "{}", result.stderr);
}

#[tokio::test]
async fn test_python_unbalanced_quote_is_runtime_failure() {
    if !installed("python3") {
        return;
    }
    let result = execute(config(), "python", "print('hi)", None).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failure, Some(FailureKind::RuntimeFailed));
    assert!(result.stderr.contains("SyntaxError"), "{}", result.stderr);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    if !installed("python3") {
        return;
    }
    let started = Instant::now();
    let result = execute(config(), "python", "while True:\n    pass", None).await;
    assert_eq!(result.status, ExecutionStatus::TimedOut);
    assert!(result.wall_time_ms >= 1000, "{}", result.wall_time_ms);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_memory_hog_is_killed() {
    if !installed("python3") {
        return;
    }
    let execution = ExecutionConfig {
        default_memory_mb: MegaByte(64),
        default_wall_clock_ms: MilliSecond(5000),
        ..config()
    };
    let code = "import time\nblock = b'x' * (512 * 1024 * 1024)\ntime.sleep(2)";
    let result = execute(execution, "python", code, None).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failure, Some(FailureKind::MemoryLimitExceeded));
    assert!(result.memory_peak_mb > 64, "{}", result.memory_peak_mb);
}

#[tokio::test]
async fn test_c_compile_and_run() {
    if !installed("gcc") {
        return;
    }
    let code = concat!(
        "#include <stdio.h>\n",
        "int main(void) { int n; scanf(\"%d\", &n); printf(\"%d\\n\", n * 2); return 0; }",
    );
    let result = execute(config(), "c", code, Some("21")).await;
    assert_eq!(result.status, ExecutionStatus::Succeeded, "{}", result.stderr);
    assert_eq!(result.stdout, "42\n");
}

#[tokio::test]
async fn test_c_compile_error() {
    if !installed("gcc") {
        return;
    }
    let code = "int main(void) { return undefined_name; }";
    let result = execute(config(), "c", code, None).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failure, Some(FailureKind::CompileFailed));
    assert_eq!(result.stdout, "");
    assert!(result.stderr.contains("undefined_name"), "{}", result.stderr);
}

#[tokio::test]
async fn test_c_segfault_reports_signal() {
    if !installed("gcc") {
        return;
    }
    let code = "int main(void) { volatile int *p = 0; *p = 1; return 0; }";
    let result = execute(config(), "c", code, None).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failure, Some(FailureKind::RuntimeFailed));
    assert_eq!(result.signal, Some(libc::SIGSEGV));
    assert_eq!(result.exit_code, None);
}

#[tokio::test]
async fn test_javascript_hello() {
    if !installed("node") {
        return;
    }
    let result = execute(config(), "javascript", "console.log('hi')", None).await;
    assert_eq!(result.status, ExecutionStatus::Succeeded, "{}", result.stderr);
    assert_eq!(result.stdout, "hi\n");
}
