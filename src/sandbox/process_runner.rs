use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::FailureKind;
use crate::languages::{
    DIR_PLACEHOLDER, INPUT_PLACEHOLDER, LanguageSpec, OUTPUT_PLACEHOLDER, render_command,
};
use crate::results::ExecutionStatus;
use crate::scheduler::Submission;

use super::monitor::bytes_to_mb_ceil;
use super::phase::{Phase, PhaseEnd, PhaseOutput, run_phase};
use super::workspace::Workspace;
use super::{ExecutionLimits, RunContext, RunOutcome, SandboxRunner};

const WORK_ROOT_PERMISSIONS: u32 = 0o700;

/// Runs toolchains as plain child processes
///
/// Each phase gets its own process group, a cleared environment and
/// rlimits for CPU time, file size and open files. Wall clock, memory and
/// output volume are supervised from the parent.
pub struct ProcessRunner {
    work_root: PathBuf,
    path_env: String,
}

impl ProcessRunner {
    pub fn build(config: &SandboxConfig) -> Result<Self> {
        let work_root = match &config.work_root {
            Some(root) => root.clone(),
            None => Self::default_work_root()?,
        };
        fs::create_dir_all(&work_root)?;
        fs::set_permissions(
            &work_root,
            fs::Permissions::from_mode(WORK_ROOT_PERMISSIONS),
        )?;

        let stale = Workspace::sweep_stale(&work_root)?;
        if stale > 0 {
            log::warn!("Removed {stale} stale workspaces from {}", work_root.display());
        }

        log::info!("ProcessRunner initialized at {}", work_root.display());
        Ok(Self {
            work_root,
            path_env: config.path_env.clone(),
        })
    }

    fn default_work_root() -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "dcode-runner")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;
        Ok(proj_dirs.cache_dir().join("sandboxes"))
    }

    fn child_env(&self, workspace: &Workspace) -> Vec<(String, String)> {
        let dir = workspace.path().to_string_lossy().into_owned();
        vec![
            ("PATH".to_string(), self.path_env.clone()),
            ("HOME".to_string(), dir.clone()),
            ("TMPDIR".to_string(), dir),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ]
    }
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    async fn run(
        &self,
        submission: &Submission,
        language: &LanguageSpec,
        limits: &ExecutionLimits,
        ctx: &mut RunContext,
    ) -> Result<RunOutcome> {
        let workspace = Workspace::create(&self.work_root)?;
        let source_path = workspace.write_source(&language.file_name, &submission.source_code)?;
        let source_path = source_path.to_string_lossy().into_owned();
        let binary_path = workspace.binary_path().to_string_lossy().into_owned();
        let dir = workspace.path().to_string_lossy().into_owned();

        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert(INPUT_PLACEHOLDER, &source_path);
        mapping.insert(OUTPUT_PLACEHOLDER, &binary_path);
        mapping.insert(DIR_PLACEHOLDER, &dir);
        let env = self.child_env(&workspace);

        // Step 1: Compile the source code
        let mut compile_time = Duration::ZERO;
        let mut compile_peak = 0;
        if let Some(template) = &language.compile_command {
            let argv = render_command(template, &mapping);
            ctx.started();
            let output = run_phase(Phase {
                argv: &argv,
                workdir: workspace.path(),
                env: &env,
                stdin: None,
                limits: &limits.compile,
                cancel: &ctx.cancel,
            })
            .await?;
            log::debug!(
                "Submission {} compiled in {:?}: {:?}",
                submission.id,
                output.wall_time,
                output.end
            );

            if !output.succeeded() {
                workspace.close();
                return Ok(compile_outcome(output));
            }
            compile_time = output.wall_time;
            compile_peak = output.memory_peak_bytes;
        }

        // Step 2: Run the program
        let argv = render_command(&language.run_command, &mapping);
        ctx.started();
        let output = run_phase(Phase {
            argv: &argv,
            workdir: workspace.path(),
            env: &env,
            stdin: Some(submission.stdin.as_deref().unwrap_or_default()),
            limits: &limits.run,
            cancel: &ctx.cancel,
        })
        .await?;
        workspace.close();

        let mut outcome = run_outcome(output);
        outcome.wall_time_ms += compile_time.as_millis() as u64;
        outcome.memory_peak_mb = outcome.memory_peak_mb.max(bytes_to_mb_ceil(compile_peak));
        Ok(outcome)
    }
}

/// Status, failure kind, exit code and signal of a finished phase
type Verdict = (ExecutionStatus, Option<FailureKind>, Option<i32>, Option<i32>);

fn classify(end: &PhaseEnd, failed_as: FailureKind) -> Verdict {
    match end {
        PhaseEnd::Exited(status) if status.success() => {
            (ExecutionStatus::Succeeded, None, Some(0), None)
        }
        PhaseEnd::Exited(status) => (
            ExecutionStatus::Failed,
            Some(failed_as),
            status.code(),
            status.signal(),
        ),
        PhaseEnd::CpuLimitExceeded(status) => {
            (ExecutionStatus::TimedOut, None, None, status.signal())
        }
        PhaseEnd::TimedOut => (ExecutionStatus::TimedOut, None, None, Some(libc::SIGKILL)),
        PhaseEnd::Cancelled => (ExecutionStatus::Cancelled, None, None, Some(libc::SIGKILL)),
        PhaseEnd::OutputLimitExceeded => (
            ExecutionStatus::Failed,
            Some(FailureKind::OutputLimitExceeded),
            None,
            Some(libc::SIGKILL),
        ),
        PhaseEnd::MemoryLimitExceeded => (
            ExecutionStatus::Failed,
            Some(FailureKind::MemoryLimitExceeded),
            None,
            Some(libc::SIGKILL),
        ),
    }
}

/// Outcome of a compile phase that did not succeed; the run phase is skipped
fn compile_outcome(output: PhaseOutput) -> RunOutcome {
    let (status, failure, exit_code, signal) = classify(&output.end, FailureKind::CompileFailed);
    let truncated = output.stdout.truncated() || output.stderr.truncated();

    // Compilers split diagnostics between both streams; the client sees them together
    let mut diagnostics = output.stdout.into_string();
    diagnostics.push_str(&output.stderr.into_string());

    RunOutcome {
        status,
        failure,
        stdout: String::new(),
        stderr: diagnostics,
        exit_code,
        signal,
        wall_time_ms: output.wall_time.as_millis() as u64,
        memory_peak_mb: bytes_to_mb_ceil(output.memory_peak_bytes),
        truncated,
    }
}

fn run_outcome(output: PhaseOutput) -> RunOutcome {
    let (status, failure, exit_code, signal) = classify(&output.end, FailureKind::RuntimeFailed);
    let truncated = output.stdout.truncated() || output.stderr.truncated();

    RunOutcome {
        status,
        failure,
        stdout: output.stdout.into_string(),
        stderr: output.stderr.into_string(),
        exit_code,
        signal,
        wall_time_ms: output.wall_time.as_millis() as u64,
        memory_peak_mb: bytes_to_mb_ceil(output.memory_peak_bytes),
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::ExecutionConfig;

    fn runner(root: &Path) -> ProcessRunner {
        ProcessRunner::build(&SandboxConfig {
            work_root: Some(root.to_path_buf()),
            ..SandboxConfig::default()
        })
        .unwrap()
    }

    /// A language whose "toolchain" is the POSIX shell, available on every test machine
    fn shell_language(compile: Option<&[&str]>) -> LanguageSpec {
        LanguageSpec {
            id: "sh".to_string(),
            display_name: "Shell".to_string(),
            file_name: "main.sh".to_string(),
            file_extension: ".sh".to_string(),
            compile_command: compile.map(|c| c.iter().map(|s| s.to_string()).collect()),
            run_command: vec!["/bin/sh".to_string(), "%INPUT%".to_string()],
            default_cpu_limit_ms: None,
            default_memory_limit_mb: None,
            default_output_limit_bytes: Some(1024),
            template: String::new(),
        }
    }

    fn submission(code: &str, stdin: Option<&str>) -> Submission {
        Submission {
            id: "test".to_string(),
            language_id: "sh".to_string(),
            source_code: code.to_string(),
            stdin: stdin.map(str::to_string),
            client_id: "client".to_string(),
            submitted_at: crate::create_timestamp(),
        }
    }

    async fn execute(
        runner: &ProcessRunner,
        language: &LanguageSpec,
        code: &str,
        stdin: Option<&str>,
        execution: &ExecutionConfig,
    ) -> RunOutcome {
        let limits = ExecutionLimits::resolve(language, execution);
        let mut ctx = RunContext::new(CancellationToken::new());
        runner
            .run(&submission(code, stdin), language, &limits, &mut ctx)
            .await
            .unwrap()
    }

    fn workspace_count(root: &Path) -> usize {
        fs::read_dir(root).unwrap().count()
    }

    #[tokio::test]
    async fn test_successful_run_reads_stdin() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        let outcome = execute(
            &runner,
            &shell_language(None),
            "read name; echo \"hi $name\"",
            Some("bob\n"),
            &ExecutionConfig::default(),
        )
        .await;
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(outcome.stdout, "hi bob\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.truncated);
        assert_eq!(workspace_count(root.path()), 0);
    }

    #[tokio::test]
    async fn test_runtime_failure_keeps_stderr() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        let outcome = execute(
            &runner,
            &shell_language(None),
            "echo broken >&2\nexit 7",
            None,
            &ExecutionConfig::default(),
        )
        .await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureKind::RuntimeFailed));
        assert_eq!(outcome.exit_code, Some(7));
        assert_eq!(outcome.stderr, "broken\n");
    }

    #[tokio::test]
    async fn test_compile_failure_skips_run() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        let language = shell_language(Some(&[
            "/bin/sh",
            "-c",
            "echo 'syntax error at line 1' >&2; exit 1",
        ]));
        let outcome = execute(
            &runner,
            &language,
            "echo should-not-run",
            None,
            &ExecutionConfig::default(),
        )
        .await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureKind::CompileFailed));
        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(outcome.stdout, "");
        assert_eq!(outcome.stderr, "syntax error at line 1\n");
        assert_eq!(workspace_count(root.path()), 0);
    }

    #[tokio::test]
    async fn test_compile_then_run_uses_artifact() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        // "Compiling" copies the source to the binary path and marks it executable
        let language = LanguageSpec {
            run_command: vec!["%OUTPUT%".to_string()],
            ..shell_language(Some(&[
                "/bin/sh",
                "-c",
                "{ echo '#!/bin/sh'; cat %INPUT%; } > %OUTPUT% && chmod +x %OUTPUT%",
            ]))
        };
        let outcome = execute(
            &runner,
            &language,
            "echo compiled",
            None,
            &ExecutionConfig::default(),
        )
        .await;
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(outcome.stdout, "compiled\n");
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        let execution = ExecutionConfig {
            default_wall_clock_ms: crate::config::MilliSecond(300),
            ..ExecutionConfig::default()
        };
        let outcome = execute(
            &runner,
            &shell_language(None),
            "while true; do sleep 1; done",
            None,
            &execution,
        )
        .await;
        assert_eq!(outcome.status, ExecutionStatus::TimedOut);
        assert!(outcome.wall_time_ms >= 300);
        assert!(outcome.wall_time_ms < 3_000);
        assert_eq!(workspace_count(root.path()), 0);
    }

    /// One second of CPU with a wall clock long enough that only the rlimit can end the run
    fn cpu_bound() -> (LanguageSpec, ExecutionConfig) {
        let language = LanguageSpec {
            default_cpu_limit_ms: Some(1000),
            ..shell_language(None)
        };
        let execution = ExecutionConfig {
            default_wall_clock_ms: crate::config::MilliSecond(10_000),
            ..ExecutionConfig::default()
        };
        (language, execution)
    }

    #[tokio::test]
    async fn test_cpu_bound_loop_times_out() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        let (language, execution) = cpu_bound();
        let outcome = execute(&runner, &language, "while :; do :; done", None, &execution).await;
        assert_eq!(outcome.status, ExecutionStatus::TimedOut);
        assert_eq!(outcome.failure, None);
        assert_eq!(outcome.signal, Some(libc::SIGXCPU));
        assert!(outcome.wall_time_ms < 8_000, "{}", outcome.wall_time_ms);
    }

    #[tokio::test]
    async fn test_cpu_loop_ignoring_sigxcpu_times_out() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        let (language, execution) = cpu_bound();
        let outcome = execute(
            &runner,
            &language,
            "trap '' XCPU; while :; do :; done",
            None,
            &execution,
        )
        .await;
        assert_eq!(outcome.status, ExecutionStatus::TimedOut);
        assert_eq!(outcome.failure, None);
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.wall_time_ms < 8_000, "{}", outcome.wall_time_ms);
        assert_eq!(workspace_count(root.path()), 0);
    }

    #[tokio::test]
    async fn test_large_output_is_truncated() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        let outcome = execute(
            &runner,
            &shell_language(None),
            "head -c 3000 /dev/zero | tr '\\0' 'a'",
            None,
            &ExecutionConfig::default(),
        )
        .await;
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert!(outcome.truncated);
        assert_eq!(outcome.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn test_output_flood_fails() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        let outcome = execute(
            &runner,
            &shell_language(None),
            "yes flood",
            None,
            &ExecutionConfig::default(),
        )
        .await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureKind::OutputLimitExceeded));
        assert!(outcome.truncated);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let root = tempfile::tempdir().unwrap();
        let runner = runner(root.path());
        let language = shell_language(None);
        let limits = ExecutionLimits::resolve(&language, &ExecutionConfig::default());
        let cancel = CancellationToken::new();
        let started = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut ctx = RunContext::new(cancel.clone()).on_start({
            let started = started.clone();
            move || started.store(true, std::sync::atomic::Ordering::SeqCst)
        });

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let outcome = runner
            .run(&submission("sleep 30", None), &language, &limits, &mut ctx)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert!(started.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert_eq!(workspace_count(root.path()), 0);
    }

    #[tokio::test]
    async fn test_stale_workspaces_removed_on_build() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("submission-left-over")).unwrap();
        let _runner = runner(root.path());
        assert_eq!(workspace_count(root.path()), 0);
    }
}
