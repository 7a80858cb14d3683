use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Priority;
use crate::error::DeliveryError;
use crate::metrics::POOL_IN_FLIGHT;

/// Bounded execution capacity shared by every consumer instance of one priority class.
///
/// Submissions are spawned right away and wait for one of `size` slots, so
/// a burst beyond the size queues up instead of being rejected. Cloning is
/// cheap and every clone refers to the same slots.
#[derive(Clone)]
pub struct WorkerPool {
    priority: Priority,
    size: usize,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// The bound elapsed; this many tasks were still pending and got cancelled.
    Forced { abandoned: usize },
}

impl WorkerPool {
    pub fn new(priority: Priority, size: NonZeroUsize) -> Self {
        Self {
            priority,
            size: size.get(),
            slots: Arc::new(Semaphore::new(size.get())),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    /// Tasks submitted and not finished yet, queued ones included.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn submit<F, T>(&self, task: F) -> JoinHandle<Result<T, DeliveryError>>
    where
        F: Future<Output = Result<T, DeliveryError>> + Send + 'static,
        T: Send + 'static,
    {
        let slots = self.slots.clone();
        let cancel = self.cancel.clone();
        let priority = self.priority;
        let size = self.size;

        self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DeliveryError::Aborted(format!(
                        "{priority} pool cancelled before a worker was free"
                    )));
                }
                permit = slots.clone().acquire_owned() => permit
                    .map_err(|_| DeliveryError::Aborted(format!("{priority} pool closed")))?,
            };
            report_in_flight(priority, size - slots.available_permits());

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DeliveryError::Aborted(format!(
                    "{priority} pool force-cancelled"
                ))),
                result = task => result,
            };

            drop(permit);
            report_in_flight(priority, size - slots.available_permits());
            result
        })
    }

    /// Wait up to `timeout` for every submitted task, then cancel whatever is left.
    pub async fn shutdown(&self, timeout: Duration) -> DrainOutcome {
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => DrainOutcome::Drained,
            Err(_elapsed) => {
                let abandoned = self.pending();
                self.cancel.cancel();
                DrainOutcome::Forced { abandoned }
            }
        }
    }
}

fn report_in_flight(priority: Priority, in_flight: usize) {
    metrics::gauge!(POOL_IN_FLIGHT, "priority" => priority.as_str()).set(in_flight as f64);
}
