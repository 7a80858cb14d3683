use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub smtp: SmtpConfig,

    #[envconfig(default = "high-priority-mails")]
    pub high_priority_topic: NonEmptyString,

    // "-tuned" groups start from a fresh offset state
    #[envconfig(default = "high-mail-consumer-group-tuned")]
    pub high_priority_group: NonEmptyString,

    #[envconfig(default = "4")]
    pub high_priority_instances: usize,

    // Sets both the worker pool size and the max records per fetch
    #[envconfig(default = "10")]
    pub high_priority_workers: NonZeroUsize,

    #[envconfig(default = "low-priority-mails")]
    pub low_priority_topic: NonEmptyString,

    #[envconfig(default = "low-mail-consumer-group-tuned")]
    pub low_priority_group: NonEmptyString,

    #[envconfig(default = "7")]
    pub low_priority_instances: usize,

    #[envconfig(default = "40")]
    pub low_priority_workers: NonZeroUsize,

    #[envconfig(from = "FETCH_TIMEOUT_MS", default = "100")]
    pub fetch_timeout: EnvMsDuration,

    #[envconfig(from = "FAILED_BATCH_BACKOFF_MS", default = "500")]
    pub failed_batch_backoff: EnvMsDuration,

    #[envconfig(from = "INSTANCE_DRAIN_TIMEOUT_MS", default = "20000")]
    pub instance_drain_timeout: EnvMsDuration,

    #[envconfig(from = "POOL_DRAIN_TIMEOUT_MS", default = "10000")]
    pub pool_drain_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The two processing lanes, HIGH first.
    pub fn priority_classes(&self) -> [PriorityClass; 2] {
        [
            PriorityClass {
                priority: Priority::High,
                topic: self.high_priority_topic.as_str().to_owned(),
                group: self.high_priority_group.as_str().to_owned(),
                instances: self.high_priority_instances,
                workers: self.high_priority_workers,
            },
            PriorityClass {
                priority: Priority::Low,
                topic: self.low_priority_topic.as_str().to_owned(),
                group: self.low_priority_group.as_str().to_owned(),
                instances: self.low_priority_instances,
                workers: self.low_priority_workers,
            },
        ]
    }

    /// Total number of consumer instances across every class.
    pub fn total_instances(&self) -> usize {
        self.high_priority_instances + self.low_priority_instances
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // earliest, latest
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,
}

#[derive(Envconfig, Clone)]
pub struct SmtpConfig {
    #[envconfig(default = "localhost")]
    pub smtp_host: String,

    #[envconfig(default = "1025")]
    pub smtp_port: u16,

    #[envconfig(default = "sender@example.com")]
    pub smtp_from: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static settings of one processing lane. Instances of a class share its
/// worker pool but never its broker offsets.
#[derive(Debug, Clone)]
pub struct PriorityClass {
    pub priority: Priority,
    pub topic: String,
    pub group: String,
    pub instances: usize,
    pub workers: NonZeroUsize,
}

impl PriorityClass {
    /// Max records pulled by one fetch. One number tunes both the pool and the batch.
    pub fn max_batch_size(&self) -> usize {
        self.workers.get()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, envconfig::Error> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env)
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let config = config_from(&[]).expect("defaults are valid");

        let [high, low] = config.priority_classes();
        assert_eq!(high.priority, Priority::High);
        assert_eq!(high.topic, "high-priority-mails");
        assert_eq!(high.group, "high-mail-consumer-group-tuned");
        assert_eq!(high.instances, 4);
        assert_eq!(high.max_batch_size(), 10);

        assert_eq!(low.priority, Priority::Low);
        assert_eq!(low.topic, "low-priority-mails");
        assert_eq!(low.instances, 7);
        assert_eq!(low.max_batch_size(), 40);

        assert_eq!(config.total_instances(), 11);
        assert_eq!(config.fetch_timeout.0, time::Duration::from_millis(100));
        assert_eq!(config.instance_drain_timeout.0, time::Duration::from_secs(20));
        assert_eq!(config.pool_drain_timeout.0, time::Duration::from_secs(10));
        assert_eq!(config.smtp.smtp_port, 1025);
        assert_eq!(config.bind(), "0.0.0.0:3302");
    }

    #[test]
    fn overrides_are_read_per_class() {
        let config = config_from(&[
            ("LOW_PRIORITY_TOPIC", "bulk-mails"),
            ("LOW_PRIORITY_WORKERS", "64"),
            ("FETCH_TIMEOUT_MS", "250"),
        ])
        .expect("overrides are valid");

        let [high, low] = config.priority_classes();
        assert_eq!(high.topic, "high-priority-mails");
        assert_eq!(low.topic, "bulk-mails");
        assert_eq!(low.workers.get(), 64);
        assert_eq!(config.fetch_timeout.0, time::Duration::from_millis(250));
    }

    #[test]
    fn rejects_empty_topic_and_zero_pool() {
        assert!(config_from(&[("HIGH_PRIORITY_TOPIC", "")]).is_err());
        assert!(config_from(&[("HIGH_PRIORITY_WORKERS", "0")]).is_err());
        assert!(config_from(&[("FETCH_TIMEOUT_MS", "soon")]).is_err());
    }

    #[test]
    fn priority_display() {
        assert_eq!(Priority::High.to_string(), "high");
        assert_eq!(Priority::Low.to_string(), "low");
    }
}
