//! Result store: snapshots of every submission from enqueue until eviction.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::create_timestamp;
use crate::error::FailureKind;
use crate::sandbox::RunOutcome;
use crate::scheduler::Submission;

/// Status reported to clients
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Scheduler-level state, finer grained than [`ExecutionStatus`]
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Queued,
    Assigned,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl SubmissionState {
    pub fn status(self) -> ExecutionStatus {
        match self {
            Self::Queued | Self::Assigned => ExecutionStatus::Pending,
            Self::Running => ExecutionStatus::Running,
            Self::Succeeded => ExecutionStatus::Succeeded,
            Self::Failed => ExecutionStatus::Failed,
            Self::TimedOut => ExecutionStatus::TimedOut,
            Self::Cancelled => ExecutionStatus::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.status().is_terminal()
    }

    fn from_terminal(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Succeeded => Self::Succeeded,
            ExecutionStatus::TimedOut => Self::TimedOut,
            ExecutionStatus::Cancelled => Self::Cancelled,
            // A runner never reports a non-terminal status as final
            ExecutionStatus::Failed | ExecutionStatus::Pending | ExecutionStatus::Running => {
                Self::Failed
            }
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub submission_id: String,
    pub language_id: String,
    pub client_id: String,
    pub status: ExecutionStatus,
    pub state: SubmissionState,
    pub failure: Option<FailureKind>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_time_ms: u64,
    pub memory_peak_mb: u64,
    pub truncated: bool,
    pub submitted_at: String,
    pub finished_at: Option<String>,
}

impl ExecutionResult {
    fn pending(submission: &Submission) -> Self {
        Self {
            submission_id: submission.id.clone(),
            language_id: submission.language_id.clone(),
            client_id: submission.client_id.clone(),
            status: ExecutionStatus::Pending,
            state: SubmissionState::Queued,
            failure: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            wall_time_ms: 0,
            memory_peak_mb: 0,
            truncated: false,
            submitted_at: submission.submitted_at.clone(),
            finished_at: None,
        }
    }

    fn set_state(&mut self, state: SubmissionState) {
        self.state = state;
        self.status = state.status();
    }
}

/// What a cancellation request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The submission was still waiting and is now terminal
    Dequeued,
    /// The owning worker was signalled to kill the sandbox
    Signalled,
    /// Nothing to do, the submission had already finished with this status
    AlreadyTerminal(ExecutionStatus),
}

struct Entry {
    result: ExecutionResult,
    cancel: Option<CancellationToken>,
    cancel_requested: bool,
    finished: Option<Instant>,
}

pub struct ResultStore {
    entries: RwLock<HashMap<String, Entry>>,
    finished: Notify,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            finished: Notify::new(),
        }
    }

    /// Registers a freshly admitted submission as `Queued`
    pub fn insert(&self, submission: &Submission) {
        let entry = Entry {
            result: ExecutionResult::pending(submission),
            cancel: None,
            cancel_requested: false,
            finished: None,
        };
        self.entries.write().insert(submission.id.clone(), entry);
    }

    /// Forgets a submission that never made it into the queue
    pub fn remove(&self, submission_id: &str) {
        self.entries.write().remove(submission_id);
    }

    pub fn get(&self, submission_id: &str) -> Option<ExecutionResult> {
        self.entries
            .read()
            .get(submission_id)
            .map(|entry| entry.result.clone())
    }

    /// Waits until the submission is terminal or `timeout` elapses, then returns its snapshot
    pub async fn wait(&self, submission_id: &str, timeout: Duration) -> Option<ExecutionResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snapshot = self.get(submission_id)?;
            if snapshot.status.is_terminal() {
                return Some(snapshot);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(submission_id);
            }
        }
    }

    /// `Queued -> Assigned`. Returns `false` when the submission is gone or no longer queued.
    pub fn assign(&self, submission_id: &str, cancel: CancellationToken) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(submission_id) {
            Some(entry) if entry.result.state == SubmissionState::Queued => {
                entry.result.set_state(SubmissionState::Assigned);
                entry.cancel = Some(cancel);
                true
            }
            _ => false,
        }
    }

    /// `Assigned -> Running`, once the first child process is spawned
    pub fn mark_running(&self, submission_id: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(submission_id)
            && entry.result.state == SubmissionState::Assigned
        {
            entry.result.set_state(SubmissionState::Running);
        }
    }

    /// Records the terminal outcome. Returns `true` only for the call that made the entry terminal.
    pub fn finish(&self, submission_id: &str, outcome: RunOutcome) -> bool {
        let changed = {
            let mut entries = self.entries.write();
            match entries.get_mut(submission_id) {
                Some(entry) if !entry.result.state.is_terminal() => {
                    let (state, failure) = if entry.cancel_requested {
                        (SubmissionState::Cancelled, None)
                    } else {
                        (SubmissionState::from_terminal(outcome.status), outcome.failure)
                    };
                    let result = &mut entry.result;
                    result.set_state(state);
                    result.failure = failure;
                    result.stdout = outcome.stdout;
                    result.stderr = outcome.stderr;
                    result.exit_code = outcome.exit_code;
                    result.signal = outcome.signal;
                    result.wall_time_ms = outcome.wall_time_ms;
                    result.memory_peak_mb = outcome.memory_peak_mb;
                    result.truncated = outcome.truncated;
                    result.finished_at = Some(create_timestamp());
                    entry.cancel = None;
                    entry.finished = Some(Instant::now());
                    true
                }
                Some(_) => {
                    log::warn!("Submission {submission_id} already terminal, outcome dropped");
                    false
                }
                None => {
                    log::warn!("Submission {submission_id} vanished before it finished");
                    false
                }
            }
        };
        if changed {
            self.finished.notify_waiters();
        }
        changed
    }

    /// Cancels a submission. `None` when the id is unknown.
    pub fn cancel(&self, submission_id: &str) -> Option<CancelOutcome> {
        let outcome = {
            let mut entries = self.entries.write();
            let entry = entries.get_mut(submission_id)?;
            match entry.result.state {
                SubmissionState::Queued => {
                    entry.result.set_state(SubmissionState::Cancelled);
                    entry.result.finished_at = Some(create_timestamp());
                    entry.finished = Some(Instant::now());
                    CancelOutcome::Dequeued
                }
                SubmissionState::Assigned | SubmissionState::Running => {
                    entry.cancel_requested = true;
                    if let Some(token) = &entry.cancel {
                        token.cancel();
                    }
                    CancelOutcome::Signalled
                }
                state => CancelOutcome::AlreadyTerminal(state.status()),
            }
        };
        if outcome == CancelOutcome::Dequeued {
            self.finished.notify_waiters();
        }
        Some(outcome)
    }

    /// Whether a client asked to cancel this submission while it was assigned or running
    pub fn cancel_requested(&self, submission_id: &str) -> bool {
        self.entries
            .read()
            .get(submission_id)
            .is_some_and(|entry| entry.cancel_requested)
    }

    /// Drops terminal results older than `retention`, returns how many were removed
    pub fn evict_expired(&self, now: Instant, retention: Duration) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| match entry.finished {
            Some(finished) => now.saturating_duration_since(finished) < retention,
            None => true,
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries currently in `state`
    pub fn count_in(&self, state: SubmissionState) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.result.state == state)
            .count()
    }
}
