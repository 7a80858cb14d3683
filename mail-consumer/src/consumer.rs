use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use health::HealthHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{Batch, Broker};
use crate::delivery::{deliver, DeliveryContext};
use crate::error::{ConsumerError, DeliveryError};
use crate::mail::MailJob;
use crate::metrics::{
    BATCHES_ABSTAINED, BATCHES_COMMITTED, BATCHES_FETCHED, BATCH_SIZE, COMMIT_FAILURES,
    FETCH_ERRORS, ITEMS_SKIPPED,
};
use crate::pool::WorkerPool;
use crate::transport::MailTransport;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId {
    pub topic: String,
    pub group: String,
    pub index: usize,
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.index)
    }
}

/// Where a consumer instance is within its fetch/dispatch/decide cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// No batch held: fetching, or about to.
    Idle = 0,
    /// Batch fanned out to the pool, waiting for every task.
    Dispatching = 1,
    /// Every outcome known, committing or abstaining.
    Deciding = 2,
    Stopped = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Idle,
            1 => LoopState::Dispatching,
            2 => LoopState::Deciding,
            _ => LoopState::Stopped,
        }
    }
}

/// The handle the registry and shutdown coordinator keep on an instance.
///
/// `request_stop` is only observed between batches. `wake` interrupts a
/// pending fetch (or the pause after an abstained batch) so an idle instance
/// notices the stop without waiting out its timeout.
#[derive(Clone)]
pub struct ConsumerControl {
    running: Arc<AtomicBool>,
    wake: CancellationToken,
    state: Arc<AtomicU8>,
}

impl Default for ConsumerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerControl {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            wake: CancellationToken::new(),
            state: Arc::new(AtomicU8::new(LoopState::Idle as u8)),
        }
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn wake(&self) {
        self.wake.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    /// Bounded wait of a single fetch.
    pub fetch_timeout: Duration,
    /// Max records per fetch.
    pub max_batch_size: usize,
    /// Pause after an abstained batch or a transient fetch error.
    pub failed_batch_backoff: Duration,
}

/// Aggregate of every item of one batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub skip_count: usize,
    /// Offset of the failed item and why it failed.
    pub failures: Vec<(i64, DeliveryError)>,
}

impl BatchOutcome {
    /// Skipped items don't count against the batch.
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    Committed,
    Abstained,
    CommitFailed,
}

/// One consumer instance: fetch, parse, fan out to the class pool, join,
/// then commit or abstain. Exactly one batch is held at a time.
pub struct BatchConsumer<B: Broker> {
    id: ConsumerId,
    broker: B,
    pool: WorkerPool,
    transport: Arc<dyn MailTransport>,
    settings: ConsumerSettings,
    control: ConsumerControl,
    liveness: Option<HealthHandle>,
}

impl<B: Broker> BatchConsumer<B> {
    pub fn new(
        id: ConsumerId,
        broker: B,
        pool: WorkerPool,
        transport: Arc<dyn MailTransport>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            id,
            broker,
            pool,
            transport,
            settings,
            control: ConsumerControl::new(),
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub fn control(&self) -> ConsumerControl {
        self.control.clone()
    }

    /// Run until stopped or until a fatal broker error. The broker client is
    /// released on every exit path.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        let span = info_span!(
            "consumer",
            topic = %self.id.topic,
            group = %self.id.group,
            index = self.id.index
        );
        async move {
            let result = match self.broker.subscribe(&self.id.topic) {
                Ok(()) => {
                    info!("Consumer {} started", self.id);
                    self.consume().await
                }
                Err(source) => Err(ConsumerError::Subscribe {
                    topic: self.id.topic.clone(),
                    source,
                }),
            };

            self.broker.close();
            self.control.set_state(LoopState::Stopped);

            match &result {
                Ok(()) => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_stopped().await;
                    }
                    info!("Consumer {} stopped gracefully.", self.id);
                }
                Err(e) => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_failed().await;
                    }
                    error!("Consumer {} stopped after a fatal error: {e}", self.id);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn consume(&mut self) -> Result<(), ConsumerError> {
        let wake = self.control.wake.clone();

        while self.control.is_running() {
            self.control.set_state(LoopState::Idle);
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy().await;
            }

            let fetched = tokio::select! {
                biased;
                _ = wake.cancelled() => break,
                fetched = self.broker.fetch(self.settings.fetch_timeout, self.settings.max_batch_size) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(e) if e.is_fatal() => {
                    metrics::counter!(FETCH_ERRORS, "topic" => self.id.topic.clone(), "kind" => "fatal")
                        .increment(1);
                    return Err(ConsumerError::Fetch(e));
                }
                Err(e) => {
                    metrics::counter!(FETCH_ERRORS, "topic" => self.id.topic.clone(), "kind" => "transient")
                        .increment(1);
                    warn!("Transient broker error, fetching again: {e}");
                    self.pause(self.settings.failed_batch_backoff).await;
                    continue;
                }
            };

            if batch.is_empty() {
                continue;
            }

            metrics::counter!(BATCHES_FETCHED, "topic" => self.id.topic.clone()).increment(1);
            metrics::histogram!(BATCH_SIZE, "topic" => self.id.topic.clone())
                .record(batch.len() as f64);

            let outcome = self.process_batch(&batch).await;
            if self.decide(&batch, &outcome) == BatchDecision::Abstained {
                self.control.set_state(LoopState::Idle);
                self.pause(self.settings.failed_batch_backoff).await;
            }
        }

        Ok(())
    }

    /// Parse every message, submit the well-formed ones and wait for all of them.
    /// A failure never short-circuits the join.
    pub async fn process_batch(&self, batch: &Batch) -> BatchOutcome {
        self.control.set_state(LoopState::Dispatching);

        let context = DeliveryContext {
            topic: Arc::from(batch.topic()),
            consumer_index: self.id.index,
        };
        let mut outcome = BatchOutcome::default();
        let mut offsets = Vec::with_capacity(batch.len());
        let mut handles = Vec::with_capacity(batch.len());

        for message in batch.messages() {
            match MailJob::parse(message.payload.as_deref()) {
                Ok(job) => {
                    offsets.push(message.offset);
                    handles.push(self.pool.submit(deliver(
                        self.transport.clone(),
                        job,
                        context.clone(),
                    )));
                }
                Err(e) => {
                    outcome.skip_count += 1;
                    warn!(
                        partition = message.partition,
                        offset = message.offset,
                        "Skipping malformed message: {e}"
                    );
                    metrics::counter!(ITEMS_SKIPPED, "topic" => self.id.topic.clone())
                        .increment(1);
                }
            }
        }

        let results = join_all(handles).await;
        self.control.set_state(LoopState::Deciding);

        for (offset, joined) in offsets.into_iter().zip(results) {
            match joined {
                Ok(Ok(())) => outcome.success_count += 1,
                Ok(Err(e)) => outcome.failures.push((offset, e)),
                Err(join_error) => outcome
                    .failures
                    .push((offset, DeliveryError::Aborted(join_error.to_string()))),
            }
        }

        outcome
    }

    /// Commit when every dispatched item succeeded, otherwise leave the
    /// checkpoint alone and rewind so the whole range is fetched again.
    fn decide(&mut self, batch: &Batch, outcome: &BatchOutcome) -> BatchDecision {
        let topic = self.id.topic.clone();

        if !outcome.all_succeeded() {
            let offsets: Vec<i64> = outcome.failures.iter().map(|(offset, _)| *offset).collect();
            error!(
                succeeded = outcome.success_count,
                failed = outcome.failures.len(),
                "Batch not committed, failed offsets {:?}",
                offsets
            );
            metrics::counter!(BATCHES_ABSTAINED, "topic" => topic).increment(1);

            if let Err(e) = self.broker.rewind(batch) {
                error!("Failed to rewind abstained batch: {e}");
            }
            return BatchDecision::Abstained;
        }

        match self.broker.commit(batch) {
            Ok(()) => {
                debug!(
                    delivered = outcome.success_count,
                    skipped = outcome.skip_count,
                    "Committed batch"
                );
                metrics::counter!(BATCHES_COMMITTED, "topic" => topic).increment(1);
                BatchDecision::Committed
            }
            Err(e) => {
                error!("Failed to commit batch: {e}");
                metrics::counter!(COMMIT_FAILURES, "topic" => topic).increment(1);
                BatchDecision::CommitFailed
            }
        }
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.control.wake.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}
