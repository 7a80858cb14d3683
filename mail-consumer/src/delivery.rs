use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::error::DeliveryError;
use crate::mail::MailJob;
use crate::metrics::{DELIVERIES, DELIVERY_LATENCY_MS};
use crate::transport::MailTransport;

/// Who is delivering: feeds the latency log line.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub topic: Arc<str>,
    pub consumer_index: usize,
}

/// Send one mail through the transport, exactly once.
///
/// Success logs the created/sent timestamps in the line format the
/// `latency-report` binary parses. Failures are handed back to the batch.
pub async fn deliver(
    transport: Arc<dyn MailTransport>,
    job: MailJob,
    context: DeliveryContext,
) -> Result<(), DeliveryError> {
    let topic = context.topic.to_string();

    if let Err(e) = transport.send(&job.to, &job.subject, &job.body).await {
        error!(to = %job.to, "Delivery failed, batch needs a retry: {e}");
        let labels = [("topic", topic), ("status", "failed".to_owned())];
        metrics::counter!(DELIVERIES, &labels).increment(1);
        return Err(e);
    }

    let sent_at = Utc::now().timestamp_millis();
    info!(
        "Topic: {} | Consumer: {} | Created: {} | Sent: {}",
        context.topic, context.consumer_index, job.created_at, sent_at
    );
    // createdAt is producer input, any i64 must leave the delivery intact
    metrics::histogram!(DELIVERY_LATENCY_MS, &[("topic", topic.clone())])
        .record(sent_at.saturating_sub(job.created_at) as f64);
    let labels = [("topic", topic), ("status", "sent".to_owned())];
    metrics::counter!(DELIVERIES, &labels).increment(1);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;

    fn job(to: &str) -> MailJob {
        MailJob {
            to: to.to_owned(),
            subject: "subject".to_owned(),
            body: "body".to_owned(),
            created_at: Utc::now().timestamp_millis(),
        }
    }

    fn context() -> DeliveryContext {
        DeliveryContext {
            topic: Arc::from("high-priority-mails"),
            consumer_index: 2,
        }
    }

    #[tokio::test]
    async fn sends_once() {
        let transport = Arc::new(MockTransport::new());

        deliver(transport.clone(), job("a@example.com"), context())
            .await
            .expect("delivery succeeds");

        assert_eq!(transport.attempts(), 1);
        assert_eq!(transport.sent(), vec!["a@example.com".to_owned()]);
    }

    #[tokio::test]
    async fn extreme_created_at_does_not_fail_a_sent_mail() {
        let transport = Arc::new(MockTransport::new());
        let mut ancient = job("c@example.com");
        ancient.created_at = i64::MIN;

        deliver(transport.clone(), ancient, context())
            .await
            .expect("latency is only observed");

        assert_eq!(transport.sent(), vec!["c@example.com".to_owned()]);
    }

    #[tokio::test]
    async fn failure_is_returned_without_retry() {
        let transport = Arc::new(MockTransport::failing_for(&["b@example.com"]));

        let err = deliver(transport.clone(), job("b@example.com"), context())
            .await
            .expect_err("transport rejects this recipient");

        assert!(matches!(err, DeliveryError::Transport(_)));
        assert_eq!(transport.attempts(), 1);
        assert!(transport.sent().is_empty());
    }
}
