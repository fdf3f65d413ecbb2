use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::results::ExecutionStatus;
use crate::sandbox::{RunContext, RunOutcome, SandboxRunner};
use crate::scheduler::{Scheduler, Submission};

/// Takes submissions off the queue until `shutdown` fires
///
/// A submission already picked up runs to completion after `shutdown`;
/// `kill` is the parent of every per-execution token and aborts it.
pub async fn worker(
    id: usize,
    scheduler: Arc<Scheduler>,
    runner: Arc<dyn SandboxRunner>,
    shutdown: CancellationToken,
    kill: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            submission = scheduler.next_submission() => {
                execute(id, &scheduler, &runner, submission, &kill).await;
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

async fn execute(
    worker_id: usize,
    scheduler: &Arc<Scheduler>,
    runner: &Arc<dyn SandboxRunner>,
    submission: Arc<Submission>,
    kill: &CancellationToken,
) {
    let submission_id = submission.id.clone();

    // 1. Acquire a slot, held until the result is recorded
    let slot = match scheduler.slots().acquire().await {
        Ok(slot) => slot,
        Err(e) => {
            log::error!("Worker {worker_id} failed to acquire a slot for {submission_id}: {e}");
            scheduler.complete(&submission, RunOutcome::internal_error("no execution slot"));
            return;
        }
    };

    // 2. Claim the submission unless it was cancelled while queued
    let cancel = kill.child_token();
    if !scheduler.assign(&submission_id, cancel.clone()) {
        log::info!("Submission {submission_id} was cancelled before it started, skipped");
        return;
    }
    log::info!(
        "Worker {worker_id} got submission {submission_id} on slot {}",
        slot.index()
    );

    let language = match scheduler.registry().get(&submission.language_id) {
        Ok(language) => language.clone(),
        Err(e) => {
            log::error!("Submission {submission_id} discarded: {e}");
            scheduler.complete(&submission, RunOutcome::internal_error(e.to_string()));
            return;
        }
    };
    let limits = scheduler.limits_for(&language);

    // 3. Run in a separate task so a panicking runner cannot take the worker down
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let runner = runner.clone();
        let submission = submission.clone();
        async move {
            let mut ctx = RunContext::new(cancel).on_start({
                let scheduler = scheduler.clone();
                let submission_id = submission.id.clone();
                move || scheduler.mark_running(&submission_id)
            });
            runner.run(&submission, &language, &limits, &mut ctx).await
        }
    });

    // 4. Give back control to the runtime until the execution is done
    let outcome = match handle.await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            log::error!("Sandbox failed for submission {submission_id}: {e:#}");
            RunOutcome::internal_error(format!("sandbox failure: {e}"))
        }
        Err(e) => {
            log::error!("Execution task for submission {submission_id} failed: {e}");
            RunOutcome::internal_error("execution task aborted")
        }
    };

    // Killed without a client asking for it: forced shutdown
    let outcome = if outcome.status == ExecutionStatus::Cancelled
        && !scheduler.cancel_requested(&submission_id)
    {
        log::warn!("Submission {submission_id} terminated during shutdown");
        RunOutcome {
            wall_time_ms: outcome.wall_time_ms,
            ..RunOutcome::internal_error("terminated during shutdown")
        }
    } else {
        outcome
    };

    scheduler.complete(&submission, outcome);
    log::debug!("Worker {worker_id} finished submission {submission_id}");
    drop(slot);
}

/// Periodically drops expired results until `shutdown` fires
pub async fn evictor(scheduler: Arc<Scheduler>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                scheduler.evict_expired();
            }
        }
    }
}
