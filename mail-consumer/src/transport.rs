use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::error::DeliveryError;

/// Outbound delivery capability. One call per mail, no retries.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), DeliveryError>;
}

/// Plain-text SMTP delivery without authentication (MailHog/Mailpit style relay).
///
/// lettre is built without its connection pool, so every send opens and
/// closes its own SMTP session.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let from = parse_mailbox(&config.smtp_from)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
            .port(config.smtp_port)
            .build();

        Ok(Self { transport, from })
    }

    fn build_message(&self, to: &str, subject: &str, body: &str) -> Result<Message, DeliveryError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to)?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_owned())?;

        Ok(message)
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let message = self.build_message(to, subject, body)?;

        self.transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| DeliveryError::InvalidAddress {
            address: address.to_owned(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp_config() -> SmtpConfig {
        SmtpConfig {
            smtp_host: "localhost".to_owned(),
            smtp_port: 1025,
            smtp_from: "sender@example.com".to_owned(),
        }
    }

    #[tokio::test]
    async fn builds_plain_text_message() {
        let transport = SmtpTransport::new(&smtp_config()).expect("valid sender");

        let message = transport
            .build_message("someone@example.com", "Weekly digest", "hello")
            .expect("valid message");
        let raw = String::from_utf8(message.formatted()).expect("message is utf-8");

        assert!(raw.contains("From: sender@example.com"));
        assert!(raw.contains("To: someone@example.com"));
        assert!(raw.contains("Subject: Weekly digest"));
        assert!(raw.contains("hello"));
    }

    #[tokio::test]
    async fn invalid_recipient_is_a_delivery_error() {
        let transport = SmtpTransport::new(&smtp_config()).expect("valid sender");

        let err = transport
            .send("not an address", "s", "b")
            .await
            .expect_err("recipient is invalid");
        assert!(matches!(err, DeliveryError::InvalidAddress { .. }));
    }

    #[test]
    fn invalid_sender_fails_construction() {
        let config = SmtpConfig {
            smtp_from: "nobody".to_owned(),
            ..smtp_config()
        };
        assert!(matches!(
            SmtpTransport::new(&config),
            Err(DeliveryError::InvalidAddress { .. })
        ));
    }
}
