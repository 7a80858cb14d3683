use std::sync::Arc;
use std::time::Duration;

use health::HealthRegistry;
use tracing::info;

use crate::broker::Broker;
use crate::config::{Config, PriorityClass};
use crate::consumer::{BatchConsumer, ConsumerId, ConsumerSettings};
use crate::error::{BrokerError, StartError};
use crate::pool::WorkerPool;
use crate::registry::ConsumerRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::transport::MailTransport;

/// A consumer must come back to the top of its loop within this window,
/// a slow batch included.
const LIVENESS_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub fetch_timeout: Duration,
    pub failed_batch_backoff: Duration,
    pub instance_drain_timeout: Duration,
    pub pool_drain_timeout: Duration,
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout.0,
            failed_batch_backoff: config.failed_batch_backoff.0,
            instance_drain_timeout: config.instance_drain_timeout.0,
            pool_drain_timeout: config.pool_drain_timeout.0,
        }
    }
}

/// Every worker pool and consumer instance of the process.
pub struct MailConsumerService {
    registry: ConsumerRegistry,
    pools: Vec<WorkerPool>,
    coordinator: ShutdownCoordinator,
}

impl MailConsumerService {
    /// Build one pool per class and `instances` consumers on it, each with a
    /// broker client of its own from `make_broker`. Brokers are all created
    /// before any instance starts, so a failure leaves nothing running.
    pub async fn start<B, F>(
        classes: &[PriorityClass],
        settings: ServiceSettings,
        transport: Arc<dyn MailTransport>,
        liveness: &HealthRegistry,
        mut make_broker: F,
    ) -> Result<Self, StartError>
    where
        B: Broker + 'static,
        F: FnMut(&PriorityClass, usize) -> Result<B, BrokerError>,
    {
        let mut lanes = Vec::with_capacity(classes.len());
        for class in classes {
            let brokers = (0..class.instances)
                .map(|index| {
                    make_broker(class, index).map_err(|source| StartError::Broker {
                        topic: class.topic.clone(),
                        index,
                        source,
                    })
                })
                .collect::<Result<Vec<B>, _>>()?;
            lanes.push((class, brokers));
        }

        let mut registry = ConsumerRegistry::new();
        let mut pools = Vec::with_capacity(classes.len());

        for (class, brokers) in lanes {
            let pool = WorkerPool::new(class.priority, class.workers);
            let consumer_settings = ConsumerSettings {
                fetch_timeout: settings.fetch_timeout,
                max_batch_size: class.max_batch_size(),
                failed_batch_backoff: settings.failed_batch_backoff,
            };

            for (index, broker) in brokers.into_iter().enumerate() {
                let id = ConsumerId {
                    topic: class.topic.clone(),
                    group: class.group.clone(),
                    index,
                };
                let handle = liveness.register(id.to_string(), LIVENESS_DEADLINE).await;
                let consumer =
                    BatchConsumer::new(id, broker, pool.clone(), transport.clone(), consumer_settings)
                        .with_liveness(handle);
                registry.spawn(class.priority, consumer)?;
            }

            info!(
                priority = %class.priority,
                topic = %class.topic,
                instances = class.instances,
                workers = class.workers.get(),
                "Started priority class"
            );
            pools.push(pool);
        }

        Ok(Self {
            registry,
            pools,
            coordinator: ShutdownCoordinator::new(
                settings.instance_drain_timeout,
                settings.pool_drain_timeout,
            ),
        })
    }

    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    pub async fn shutdown(self) -> ShutdownReport {
        self.coordinator.shutdown(self.registry, &self.pools).await
    }
}
