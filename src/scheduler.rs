//! Admission, dispatch bookkeeping and cancellation for submissions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionConfig;
use crate::create_timestamp;
use crate::error::ServiceError;
use crate::languages::{LanguageRegistry, LanguageSpec};
use crate::queue::SubmissionQueue;
use crate::quota::{Admission, ClientStats, QuotaTracker};
use crate::results::{
    CancelOutcome, ExecutionResult, ExecutionStatus, ResultStore, SubmissionState,
};
use crate::sandbox::{ExecutionLimits, RunOutcome};
use crate::slots::SlotPool;

/// One client request to execute source code. Immutable once admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: String,
    pub language_id: String,
    pub source_code: String,
    pub stdin: Option<String>,
    pub client_id: String,
    pub submitted_at: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub language_id: String,
    pub code: String,
    #[serde(default)]
    pub stdin: Option<String>,
    pub client_id: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub slots: usize,
    pub queue_capacity: usize,
    pub results: usize,
    pub clients: Vec<ClientStats>,
}

/// Shared handle over every piece of process-wide execution state
///
/// Built once at startup and passed to the HTTP handlers and to every
/// worker; dropped after the workers have drained.
pub struct Scheduler {
    registry: LanguageRegistry,
    execution: ExecutionConfig,
    queue: SubmissionQueue,
    store: ResultStore,
    quota: QuotaTracker,
    slots: SlotPool,
}

impl Scheduler {
    pub fn new(registry: LanguageRegistry, execution: ExecutionConfig) -> Self {
        Self {
            queue: SubmissionQueue::new(execution.queue_capacity),
            store: ResultStore::new(),
            quota: QuotaTracker::new(
                execution.rate_per_minute,
                execution.max_in_flight_per_client,
            ),
            slots: SlotPool::new(execution.max_concurrent_slots),
            registry,
            execution,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    /// Validates and enqueues a submission, returning its id
    ///
    /// A rejected request leaves nothing behind: no queue entry, no
    /// result and no quota usage.
    pub fn submit(&self, request: SubmitRequest) -> Result<String, ServiceError> {
        if self.queue.is_closed() {
            return Err(ServiceError::ShuttingDown);
        }
        self.registry.get(&request.language_id)?;
        if request.code.trim().is_empty() {
            return Err(ServiceError::EmptySource);
        }
        if request.code.len() > self.execution.max_source_bytes {
            return Err(ServiceError::SourceTooLarge {
                size: request.code.len(),
                limit: self.execution.max_source_bytes,
            });
        }

        match self.quota.try_admit(&request.client_id) {
            Admission::Allowed => {}
            Admission::RateLimited => return Err(ServiceError::RateLimited(request.client_id)),
            Admission::ConcurrencyLimitExceeded => {
                return Err(ServiceError::ConcurrencyLimitExceeded(request.client_id));
            }
        }

        let submission = Arc::new(Submission {
            id: uuid::Uuid::new_v4().to_string(),
            language_id: request.language_id,
            source_code: request.code,
            stdin: request.stdin,
            client_id: request.client_id,
            submitted_at: create_timestamp(),
        });

        // The result must exist before a worker can pop the submission
        self.store.insert(&submission);
        if let Err(e) = self.queue.try_push(submission.clone()) {
            self.store.remove(&submission.id);
            self.quota.rollback(&submission.client_id);
            log::warn!(
                "Rejected submission from client {}: {e}",
                submission.client_id
            );
            return Err(e);
        }

        log::info!(
            "Queued submission {} ({}) from client {}",
            submission.id,
            submission.language_id,
            submission.client_id
        );
        Ok(submission.id.clone())
    }

    /// Cancels a submission and returns the status it ends up with
    ///
    /// Safe to call repeatedly: a terminal submission reports its status unchanged.
    pub fn cancel(&self, submission_id: &str) -> Result<ExecutionStatus, ServiceError> {
        let outcome = self
            .store
            .cancel(submission_id)
            .ok_or_else(|| ServiceError::NotFound(submission_id.to_string()))?;

        match outcome {
            CancelOutcome::Dequeued => {
                // A worker may have popped it already; it will fail to assign and skip it
                self.queue.remove(submission_id);
                if let Some(result) = self.store.get(submission_id) {
                    self.quota.release(&result.client_id);
                }
                log::info!("Cancelled queued submission {submission_id}");
                Ok(ExecutionStatus::Cancelled)
            }
            CancelOutcome::Signalled => {
                log::info!("Cancellation requested for running submission {submission_id}");
                Ok(ExecutionStatus::Cancelled)
            }
            CancelOutcome::AlreadyTerminal(status) => Ok(status),
        }
    }

    pub fn result(&self, submission_id: &str) -> Result<ExecutionResult, ServiceError> {
        self.store
            .get(submission_id)
            .ok_or_else(|| ServiceError::NotFound(submission_id.to_string()))
    }

    /// Returns once the submission is terminal or `timeout` has elapsed
    pub async fn wait_result(
        &self,
        submission_id: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, ServiceError> {
        self.store
            .wait(submission_id, timeout)
            .await
            .ok_or_else(|| ServiceError::NotFound(submission_id.to_string()))
    }

    /// Waits for the oldest queued submission
    pub async fn next_submission(&self) -> Arc<Submission> {
        self.queue.pop().await
    }

    /// Claims a popped submission for execution
    ///
    /// Returns `false` if it was cancelled in the meantime; the caller must then skip it.
    pub fn assign(&self, submission_id: &str, cancel: CancellationToken) -> bool {
        self.store.assign(submission_id, cancel)
    }

    pub fn mark_running(&self, submission_id: &str) {
        self.store.mark_running(submission_id);
    }

    pub fn cancel_requested(&self, submission_id: &str) -> bool {
        self.store.cancel_requested(submission_id)
    }

    pub fn limits_for(&self, language: &LanguageSpec) -> ExecutionLimits {
        ExecutionLimits::resolve(language, &self.execution)
    }

    /// Records the terminal outcome and frees the client's in-flight quota
    pub fn complete(&self, submission: &Submission, outcome: RunOutcome) -> bool {
        let status = outcome.status;
        if !self.store.finish(&submission.id, outcome) {
            return false;
        }
        self.quota.release(&submission.client_id);
        log::info!("Submission {} finished: {status:?}", submission.id);
        true
    }

    /// Stops admission and fails every submission still waiting in the queue
    pub fn close(&self) -> usize {
        let drained = self.queue.close();
        let count = drained.len();
        for submission in drained {
            self.complete(
                &submission,
                RunOutcome::internal_error("service shut down before execution"),
            );
        }
        if count > 0 {
            log::warn!("Failed {count} queued submissions at shutdown");
        }
        count
    }

    /// Drops terminal results past the retention window and clients with no recent activity
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let retention = Duration::from_secs(self.execution.result_retention_seconds);
        let evicted = self.store.evict_expired(now, retention);
        if evicted > 0 {
            log::debug!("Evicted {evicted} expired results");
        }
        let idle = self.quota.prune_idle(now);
        if idle > 0 {
            log::debug!("Pruned {idle} idle clients");
        }
        evicted
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.store.count_in(SubmissionState::Queued),
            running: self.store.count_in(SubmissionState::Assigned)
                + self.store.count_in(SubmissionState::Running),
            slots: self.slots.size(),
            queue_capacity: self.queue.capacity(),
            results: self.store.len(),
            clients: self.quota.snapshot(),
        }
    }
}
