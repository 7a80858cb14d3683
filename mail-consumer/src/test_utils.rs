use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::broker::{Batch, Broker, RawMessage};
use crate::error::{BrokerError, DeliveryError};
use crate::transport::MailTransport;

/// JSON payload of a well-formed mail addressed to `to`.
pub fn mail_payload(to: &str) -> Vec<u8> {
    serde_json::json!({
        "to": to,
        "subject": format!("mail for {to}"),
        "body": "hello",
        "createdAt": chrono::Utc::now().timestamp_millis(),
    })
    .to_string()
    .into_bytes()
}

/// A batch on partition 0 with consecutive offsets starting at `first_offset`.
pub fn batch_of(topic: &str, first_offset: i64, payloads: Vec<Option<Vec<u8>>>) -> Batch {
    let messages = payloads
        .into_iter()
        .zip(first_offset..)
        .map(|(payload, offset)| RawMessage {
            partition: 0,
            offset,
            payload,
        })
        .collect();
    Batch::new(topic, messages)
}

enum Scripted {
    Batch(Batch),
    Error(BrokerError),
}

#[derive(Default)]
struct MockBrokerState {
    topic: Option<String>,
    script: VecDeque<Scripted>,
    commits: Vec<(Batch, Instant)>,
    rewinds: Vec<Batch>,
    fetches: usize,
    closed_at: Option<Instant>,
    fail_subscribe: bool,
    fail_commits: bool,
}

/// In-memory broker. Clones share state, so tests keep one to inspect what
/// the consumer did with the other.
///
/// A fetch pops the next scripted batch or error. With nothing scripted it
/// waits out its timeout and returns an empty batch, or, for a blocking
/// broker, never returns at all.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockBrokerState>>,
    blocking: bool,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker whose empty fetch ignores its timeout, only a wake signal gets the consumer out.
    pub fn blocking() -> Self {
        Self {
            blocking: true,
            ..Self::default()
        }
    }

    pub fn push_batch(&self, batch: Batch) {
        self.lock().script.push_back(Scripted::Batch(batch));
    }

    pub fn push_error(&self, error: BrokerError) {
        self.lock().script.push_back(Scripted::Error(error));
    }

    pub fn fail_subscribe(&self) {
        self.lock().fail_subscribe = true;
    }

    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    pub fn subscribed_topic(&self) -> Option<String> {
        self.lock().topic.clone()
    }

    pub fn commits(&self) -> Vec<Batch> {
        self.lock().commits.iter().map(|(b, _)| b.clone()).collect()
    }

    pub fn commit_times(&self) -> Vec<Instant> {
        self.lock().commits.iter().map(|(_, at)| *at).collect()
    }

    pub fn rewinds(&self) -> Vec<Batch> {
        self.lock().rewinds.clone()
    }

    pub fn fetches(&self) -> usize {
        self.lock().fetches
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed_at.is_some()
    }

    pub fn closed_at(&self) -> Option<Instant> {
        self.lock().closed_at
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockBrokerState> {
        self.state.lock().expect("poisoned mock broker")
    }
}

#[async_trait]
impl Broker for MockBroker {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.fail_subscribe {
            return Err(BrokerError::Disconnected("subscribe refused".to_owned()));
        }
        state.topic = Some(topic.to_owned());
        Ok(())
    }

    async fn fetch(
        &mut self,
        timeout: Duration,
        _max_messages: usize,
    ) -> Result<Batch, BrokerError> {
        let next = {
            let mut state = self.lock();
            if state.closed_at.is_some() {
                return Err(BrokerError::Disconnected("closed".to_owned()));
            }
            state.fetches += 1;
            state.script.pop_front()
        };

        match next {
            Some(Scripted::Batch(batch)) => Ok(batch),
            Some(Scripted::Error(error)) => Err(error),
            None if self.blocking => std::future::pending().await,
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Batch::default())
            }
        }
    }

    fn commit(&mut self, batch: &Batch) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.fail_commits {
            return Err(BrokerError::Disconnected("commit refused".to_owned()));
        }
        state.commits.push((batch.clone(), Instant::now()));
        Ok(())
    }

    fn rewind(&mut self, batch: &Batch) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.rewinds.push(batch.clone());
        // Redeliver the very same range on the next fetch
        state.script.push_front(Scripted::Batch(batch.clone()));
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.lock();
        if state.closed_at.is_none() {
            state.closed_at = Some(Instant::now());
        }
    }
}

/// Transport double: records every attempt, fails for chosen recipients,
/// optionally takes its time and tracks how many sends overlap.
#[derive(Default)]
pub struct MockTransport {
    failing: Mutex<HashSet<String>>,
    delay: Duration,
    attempts: AtomicUsize,
    sent: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    last_completed_at: Mutex<Option<Instant>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(recipients: &[&str]) -> Self {
        let transport = Self::new();
        transport.set_failing(recipients);
        transport
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, recipients: &[&str]) {
        let mut failing = self.failing.lock().expect("poisoned mock transport");
        failing.clear();
        failing.extend(recipients.iter().map(|r| r.to_string()));
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Recipients of successful sends, in completion order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("poisoned mock transport").clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn last_completed_at(&self) -> Option<Instant> {
        *self.last_completed_at.lock().expect("poisoned mock transport")
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn send(&self, to: &str, _subject: &str, _body: &str) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let fails = self
            .failing
            .lock()
            .expect("poisoned mock transport")
            .contains(to);

        self.running.fetch_sub(1, Ordering::SeqCst);
        *self.last_completed_at.lock().expect("poisoned mock transport") = Some(Instant::now());

        if fails {
            return Err(DeliveryError::Transport(format!("550 mailbox unavailable: {to}")));
        }
        self.sent
            .lock()
            .expect("poisoned mock transport")
            .push(to.to_owned());
        Ok(())
    }
}
