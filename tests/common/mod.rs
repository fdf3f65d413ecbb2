#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use dcode_runner::config::ExecutionConfig;
use dcode_runner::languages::{LanguageRegistry, LanguageSpec};
use dcode_runner::results::{ExecutionResult, ExecutionStatus};
use dcode_runner::sandbox::{ExecutionLimits, RunContext, RunOutcome, SandboxRunner};
use dcode_runner::scheduler::{Scheduler, SubmitRequest, Submission};
use dcode_runner::worker::worker;

/// Runner whose behavior is chosen by the submitted source:
///
/// - `sleep <ms>`: sleeps, honoring the wall-clock limit and cancellation
/// - `panic`: panics inside the execution task
/// - `fail`: returns a sandbox error
/// - anything else: succeeds, echoing stdin (or the source when there is none)
#[derive(Default)]
pub struct FakeRunner {
    pub started: Mutex<Vec<String>>,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

#[async_trait]
impl SandboxRunner for FakeRunner {
    async fn run(
        &self,
        submission: &Submission,
        _language: &LanguageSpec,
        limits: &ExecutionLimits,
        ctx: &mut RunContext,
    ) -> anyhow::Result<RunOutcome> {
        ctx.started();
        self.started.lock().push(submission.source_code.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let outcome = behave(submission, limits, ctx).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

async fn behave(
    submission: &Submission,
    limits: &ExecutionLimits,
    ctx: &mut RunContext,
) -> anyhow::Result<RunOutcome> {
    let code = submission.source_code.trim();
    if let Some(ms) = code.strip_prefix("sleep ") {
        let requested = Duration::from_millis(ms.parse()?);
        let wall_clock = limits.run.wall_clock;
        tokio::select! {
            _ = tokio::time::sleep(requested.min(wall_clock)) => {}
            _ = ctx.cancel.cancelled() => return Ok(RunOutcome::cancelled()),
        }
        if requested > wall_clock {
            return Ok(RunOutcome {
                status: ExecutionStatus::TimedOut,
                failure: None,
                wall_time_ms: wall_clock.as_millis() as u64,
                ..RunOutcome::cancelled()
            });
        }
        return Ok(succeeded(String::new()));
    }
    match code {
        "panic" => panic!("runner blew up"),
        "fail" => bail!("workspace could not be created"),
        _ => Ok(succeeded(
            submission
                .stdin
                .clone()
                .unwrap_or_else(|| submission.source_code.clone()),
        )),
    }
}

fn succeeded(stdout: String) -> RunOutcome {
    RunOutcome {
        status: ExecutionStatus::Succeeded,
        failure: None,
        stdout,
        stderr: String::new(),
        exit_code: Some(0),
        signal: None,
        wall_time_ms: 1,
        memory_peak_mb: 1,
        truncated: false,
    }
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub runner: Arc<FakeRunner>,
    pub shutdown: CancellationToken,
    pub kill: CancellationToken,
    pub workers: JoinSet<anyhow::Result<()>>,
}

impl Harness {
    /// Scheduler over the built-in languages with no workers yet
    pub fn new(execution: ExecutionConfig) -> Self {
        Self {
            scheduler: Arc::new(Scheduler::new(LanguageRegistry::builtin(), execution)),
            runner: Arc::new(FakeRunner::default()),
            shutdown: CancellationToken::new(),
            kill: CancellationToken::new(),
            workers: JoinSet::new(),
        }
    }

    /// Same as [`Harness::new`] with one worker per slot already running
    pub fn start(execution: ExecutionConfig) -> Self {
        let mut harness = Self::new(execution);
        harness.spawn_workers();
        harness
    }

    pub fn spawn_workers(&mut self) {
        for i in 1..=self.scheduler.slots().size() {
            self.workers.spawn(worker(
                i,
                self.scheduler.clone(),
                self.runner.clone(),
                self.shutdown.clone(),
                self.kill.clone(),
            ));
        }
    }

    pub fn submit(&self, client_id: &str, code: &str) -> String {
        self.scheduler.submit(request(client_id, code)).unwrap()
    }

    pub async fn wait(&self, submission_id: &str) -> ExecutionResult {
        self.scheduler
            .wait_result(submission_id, Duration::from_secs(10))
            .await
            .unwrap()
    }

    /// Polls until the submission reports `status`
    pub async fn wait_for_status(&self, submission_id: &str, status: ExecutionStatus) {
        for _ in 0..1000 {
            if self.scheduler.result(submission_id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("submission {submission_id} never reached {status:?}");
    }

    /// Stops the workers the way the server does on shutdown, killing what is still running
    pub async fn shutdown(mut self) {
        self.scheduler.close();
        self.shutdown.cancel();
        self.kill.cancel();
        while let Some(res) = self.workers.join_next().await {
            res.unwrap().unwrap();
        }
    }
}

pub fn request(client_id: &str, code: &str) -> SubmitRequest {
    SubmitRequest {
        language_id: "python".to_string(),
        code: code.to_string(),
        stdin: None,
        client_id: client_id.to_string(),
    }
}

pub fn fast_config() -> ExecutionConfig {
    ExecutionConfig {
        max_concurrent_slots: 2,
        queue_capacity: 16,
        max_in_flight_per_client: 16,
        rate_per_minute: 100,
        ..ExecutionConfig::default()
    }
}
