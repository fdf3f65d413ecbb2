use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-size pool bounding how many sandboxes run at once
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    free: Arc<Mutex<Vec<usize>>>,
}

/// Exclusive right to run one sandbox, returned to the pool on drop
#[derive(Debug)]
pub struct ExecutionSlot {
    index: usize,
    free: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl ExecutionSlot {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        // The index goes back before the permit so the next holder finds it
        self.free.lock().push(self.index);
        log::debug!("Slot {} released", self.index);
    }
}

impl SlotPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            free: Arc::new(Mutex::new((0..size).rev().collect())),
        }
    }

    /// Waits until a slot is free
    pub async fn acquire(&self) -> anyhow::Result<ExecutionSlot> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        let index = self
            .free
            .lock()
            .pop()
            .ok_or_else(|| anyhow::anyhow!("slot permit granted without a free slot"))?;
        Ok(ExecutionSlot {
            index,
            free: self.free.clone(),
            _permit: permit,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_use(&self) -> usize {
        self.size - self.free.lock().len()
    }
}
