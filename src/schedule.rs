//! Cancellable scheduled-task slot.
//!
//! Holds at most one spawned task. Arming the slot aborts whatever was in it
//! before, so a component can never end up with two live timers.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct TaskSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handle`, aborting the previously armed task if any.
    ///
    /// Returns true when a previous task was replaced.
    pub fn replace(&self, handle: JoinHandle<()>) -> bool {
        let previous = self.lock().replace(handle);
        match previous {
            Some(old) => {
                old.abort();
                true
            }
            None => false,
        }
    }

    /// Aborts the armed task. Returns true if one was armed.
    pub fn cancel(&self) -> bool {
        match self.lock().take() {
            Some(old) => {
                old.abort();
                true
            }
            None => false,
        }
    }

    /// True while an armed task has not finished.
    pub fn is_armed(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(handle) = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
