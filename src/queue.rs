use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ServiceError;
use crate::scheduler::Submission;

/// Bounded FIFO of submissions waiting for a slot
pub struct SubmissionQueue {
    inner: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

struct QueueState {
    items: VecDeque<Arc<Submission>>,
    closed: bool,
}

impl SubmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Appends a submission, rejecting it instead of growing past capacity
    pub fn try_push(&self, submission: Arc<Submission>) -> Result<(), ServiceError> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(ServiceError::ShuttingDown);
            }
            if state.items.len() >= self.capacity {
                return Err(ServiceError::QueueFull);
            }
            state.items.push_back(submission);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the oldest submission
    pub async fn pop(&self) -> Arc<Submission> {
        loop {
            if let Some(submission) = self.inner.lock().items.pop_front() {
                return submission;
            }
            self.notify.notified().await;
        }
    }

    /// Removes a waiting submission, returns `None` if it is no longer queued
    pub fn remove(&self, submission_id: &str) -> Option<Arc<Submission>> {
        let mut state = self.inner.lock();
        let index = state.items.iter().position(|s| s.id == submission_id)?;
        state.items.remove(index)
    }

    /// Refuses further pushes and hands back everything still waiting
    pub fn close(&self) -> Vec<Arc<Submission>> {
        let mut state = self.inner.lock();
        state.closed = true;
        state.items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
