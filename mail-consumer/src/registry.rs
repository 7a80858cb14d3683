use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::error;

use crate::broker::Broker;
use crate::config::Priority;
use crate::consumer::{BatchConsumer, ConsumerControl, ConsumerId, LoopState};
use crate::error::{ConsumerError, RegistryClosed};

pub struct ConsumerHandle {
    pub id: ConsumerId,
    pub priority: Priority,
    control: ConsumerControl,
    task: JoinHandle<Result<(), ConsumerError>>,
}

impl ConsumerHandle {
    pub fn state(&self) -> LoopState {
        self.control.state()
    }
}

/// How a consumer instance ended.
#[derive(Debug)]
pub enum InstanceExit {
    Stopped,
    Failed(ConsumerError),
    /// Aborted after the drain bound, or panicked.
    Aborted,
}

/// The fixed set of running consumer instances. The tracker is the
/// execution context they run on; once closed no instance can be added.
pub struct ConsumerRegistry {
    tracker: TaskTracker,
    handles: Vec<ConsumerHandle>,
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            handles: Vec::new(),
        }
    }

    pub fn spawn<B>(
        &mut self,
        priority: Priority,
        consumer: BatchConsumer<B>,
    ) -> Result<(), RegistryClosed>
    where
        B: Broker + 'static,
    {
        if self.tracker.is_closed() {
            return Err(RegistryClosed);
        }

        let id = consumer.id().clone();
        let control = consumer.control();
        let task = self.tracker.spawn(consumer.run());

        self.handles.push(ConsumerHandle {
            id,
            priority,
            control,
            task,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[ConsumerHandle] {
        &self.handles
    }

    pub fn ids(&self) -> Vec<ConsumerId> {
        self.handles.iter().map(|h| h.id.clone()).collect()
    }

    pub fn request_stop_all(&self) {
        for handle in &self.handles {
            handle.control.request_stop();
        }
    }

    pub fn wake_all(&self) {
        for handle in &self.handles {
            handle.control.wake();
        }
    }

    pub fn close(&self) {
        self.tracker.close();
    }

    /// Wait up to `timeout` for every instance to exit. On timeout, returns
    /// the instances still running.
    pub async fn wait_stopped(&self, timeout: Duration) -> Result<(), Vec<ConsumerId>> {
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => Ok(()),
            Err(_elapsed) => Err(self
                .handles
                .iter()
                .filter(|h| !h.task.is_finished())
                .map(|h| h.id.clone())
                .collect()),
        }
    }

    /// Abort every instance still running, returning which ones were hit.
    pub fn abort_remaining(&self) -> Vec<ConsumerId> {
        self.handles
            .iter()
            .filter(|h| !h.task.is_finished())
            .map(|h| {
                h.task.abort();
                h.id.clone()
            })
            .collect()
    }

    /// Collect how every instance ended. Meant to be called once all of them
    /// stopped or were aborted.
    pub async fn join(self) -> Vec<(ConsumerId, InstanceExit)> {
        let mut exits = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let exit = match handle.task.await {
                Ok(Ok(())) => InstanceExit::Stopped,
                Ok(Err(e)) => InstanceExit::Failed(e),
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!("Consumer {} panicked: {join_error}", handle.id);
                    }
                    InstanceExit::Aborted
                }
            };
            exits.push((handle.id, exit));
        }
        exits
    }
}
