use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Why a raw message could not become a `MailJob`. Terminal for that item only.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("message has no payload")]
    EmptyPayload,
    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("required field {0} is missing")]
    MissingField(&'static str),
    #[error("field {field} must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("destination address is empty")]
    EmptyDestination,
}

/// A single delivery attempt failed. Reported to the owning batch.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("delivery task did not complete: {0}")]
    Aborted(String),
}

/// Failure of a broker call: subscribe, fetch, commit or rewind.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("broker connection lost: {0}")]
    Disconnected(String),
}

impl BrokerError {
    /// Fatal errors end the consumer instance; everything else is retried on the next fetch.
    pub fn is_fatal(&self) -> bool {
        match self {
            BrokerError::Kafka(KafkaError::MessageConsumptionFatal(_)) => true,
            BrokerError::Kafka(KafkaError::Subscription(_)) => true,
            BrokerError::Kafka(KafkaError::ClientCreation(_)) => true,
            BrokerError::Kafka(KafkaError::Global(code)) => matches!(
                code,
                RDKafkaErrorCode::Authentication
                    | RDKafkaErrorCode::SaslAuthenticationFailed
                    | RDKafkaErrorCode::TopicAuthorizationFailed
                    | RDKafkaErrorCode::GroupAuthorizationFailed
                    | RDKafkaErrorCode::Fatal
            ),
            BrokerError::Kafka(KafkaError::MessageConsumption(code)) => matches!(
                code,
                RDKafkaErrorCode::TopicAuthorizationFailed
                    | RDKafkaErrorCode::GroupAuthorizationFailed
                    | RDKafkaErrorCode::Fatal
            ),
            BrokerError::Kafka(_) => false,
            BrokerError::Disconnected(_) => true,
        }
    }
}

/// Unrecoverable failure of one consumer instance. Siblings keep running.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },
    #[error("fetch failed: {0}")]
    Fetch(#[source] BrokerError),
}

#[derive(Error, Debug)]
#[error("consumer registry no longer accepts instances")]
pub struct RegistryClosed;

/// The service could not bring up its consumer instances.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("failed to create broker client for {topic} instance {index}: {source}")]
    Broker {
        topic: String,
        index: usize,
        #[source]
        source: BrokerError,
    },
    #[error(transparent)]
    RegistryClosed(#[from] RegistryClosed),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_broker_errors() {
        let timeout = BrokerError::Kafka(KafkaError::MessageConsumption(
            RDKafkaErrorCode::OperationTimedOut,
        ));
        assert!(!timeout.is_fatal());

        let brokers_down = BrokerError::Kafka(KafkaError::Global(RDKafkaErrorCode::AllBrokersDown));
        assert!(!brokers_down.is_fatal());

        let auth = BrokerError::Kafka(KafkaError::Global(RDKafkaErrorCode::Authentication));
        assert!(auth.is_fatal());

        let fatal = BrokerError::Kafka(KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fatal,
        ));
        assert!(fatal.is_fatal());

        assert!(BrokerError::Disconnected("gone".to_owned()).is_fatal());
    }
}
