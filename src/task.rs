//! Cancellable background tasks.
//!
//! Work runs on a named thread. Its result is parked in a slot shared by
//! every clone of the handle; the worker then drops its end of a crossbeam
//! channel, and that disconnect wakes every waiter at once.
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::{bounded, Receiver};

use crate::error::{FusionError, Result};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FusionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Text of a panic payload, for logs and errors.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

type Slot<T> = Arc<Mutex<Option<Result<T>>>>;

fn lock<T>(slot: &Mutex<Option<Result<T>>>) -> MutexGuard<'_, Option<Result<T>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a background computation. Clones observe the same outcome.
#[derive(Debug)]
pub struct TaskHandle<T> {
    name: String,
    cancel: CancellationToken,
    slot: Slot<T>,
    /// Never carries a message; disconnects when the worker is done.
    done: Receiver<()>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            cancel: self.cancel.clone(),
            slot: Arc::clone(&self.slot),
            done: self.done.clone(),
        }
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Runs `work` on its own thread. The closure receives the task's token
    /// and is expected to check it between units of work. A panic inside
    /// `work` is reported as [`FusionError::TaskPanicked`].
    pub fn spawn<F>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let (tx, rx) = bounded::<()>(0);
        let token = cancel.clone();
        let slot: Slot<T> = Arc::new(Mutex::new(None));
        let parked = Arc::clone(&slot);
        let label = name.clone();
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&token)))
                    .unwrap_or_else(|payload| {
                        let message = panic_message(payload.as_ref());
                        tracing::error!("task {} panicked: {}", label, message);
                        Err(FusionError::TaskPanicked(message))
                    });
                *lock(&parked) = Some(outcome);
                drop(tx);
            });
        if let Err(e) = spawned {
            tracing::error!("could not spawn task {}: {}", name, e);
            *lock(&slot) = Some(Err(FusionError::Cancelled));
        }
        Self {
            name,
            cancel,
            slot,
            done: rx,
        }
    }
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the worker has delivered its result.
    pub fn is_finished(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Non-blocking poll. `None` while the task is still running.
    pub fn try_result(&self) -> Option<Result<T>> {
        lock(&self.slot).clone()
    }

    /// Blocks until the worker finishes. Only for callers that are already
    /// off the interactive path.
    pub fn wait(&self) -> Result<T> {
        // only ever returns once the sender is dropped
        let _ = self.done.recv();
        lock(&self.slot)
            .clone()
            .unwrap_or(Err(FusionError::Cancelled))
    }
}
