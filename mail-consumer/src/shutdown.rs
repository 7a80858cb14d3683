use std::time::Duration;

use futures::future::join_all;
use tokio::signal::unix::SignalKind;
use tracing::{error, info, warn};

use crate::config::Priority;
use crate::consumer::ConsumerId;
use crate::error::ConsumerError;
use crate::metrics::FORCED_SHUTDOWNS;
use crate::pool::{DrainOutcome, WorkerPool};
use crate::registry::{ConsumerRegistry, InstanceExit};

/// Waits for SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Instances that reached `Stopped` on their own.
    pub stopped: Vec<ConsumerId>,
    /// Instances that had already ended on a fatal error.
    pub failed: Vec<(ConsumerId, ConsumerError)>,
    /// Instances aborted once the instance bound elapsed.
    pub forced: Vec<ConsumerId>,
    pub pools: Vec<(Priority, DrainOutcome)>,
}

impl ShutdownReport {
    /// Nothing had to be force-cancelled.
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
            && self
                .pools
                .iter()
                .all(|(_, outcome)| *outcome == DrainOutcome::Drained)
    }
}

/// Stops every consumer instance, then drains the worker pools. Each wait is
/// bounded; whatever is left after its bound is cancelled and reported.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownCoordinator {
    instance_timeout: Duration,
    pool_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(instance_timeout: Duration, pool_timeout: Duration) -> Self {
        Self {
            instance_timeout,
            pool_timeout,
        }
    }

    pub async fn shutdown(&self, registry: ConsumerRegistry, pools: &[WorkerPool]) -> ShutdownReport {
        info!(instances = registry.len(), "Stopping consumer instances");

        registry.request_stop_all();
        registry.wake_all();
        registry.close();

        if let Err(stuck) = registry.wait_stopped(self.instance_timeout).await {
            error!(
                "{} consumer instances did not stop within {:?}, aborting: {:?}",
                stuck.len(),
                self.instance_timeout,
                stuck
            );
            metrics::counter!(FORCED_SHUTDOWNS, "target" => "instances").increment(1);
            registry.abort_remaining();
        }

        // Each pool gets its own bound, measured from the same start
        let pool_timeout = self.pool_timeout;
        let pools = join_all(pools.iter().map(|pool| async move {
            let outcome = pool.shutdown(pool_timeout).await;
            if let DrainOutcome::Forced { abandoned } = outcome {
                error!(
                    "{} pool did not drain within {:?}, cancelled {} tasks",
                    pool.priority(),
                    pool_timeout,
                    abandoned
                );
                metrics::counter!(FORCED_SHUTDOWNS, "target" => "pool", "priority" => pool.priority().as_str())
                    .increment(1);
            }
            (pool.priority(), outcome)
        }))
        .await;

        let mut report = ShutdownReport {
            pools,
            ..Default::default()
        };
        for (id, exit) in registry.join().await {
            match exit {
                InstanceExit::Stopped => report.stopped.push(id),
                InstanceExit::Failed(e) => {
                    warn!("Consumer {id} had already failed: {e}");
                    report.failed.push((id, e));
                }
                InstanceExit::Aborted => report.forced.push(id),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    #[tokio::test]
    async fn empty_service_shuts_down_cleanly() {
        let pool = WorkerPool::new(Priority::High, NonZeroUsize::new(2).unwrap());
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1), Duration::from_secs(1));

        let report = coordinator
            .shutdown(ConsumerRegistry::new(), &[pool])
            .await;

        assert!(report.is_clean());
        assert_eq!(report.pools, vec![(Priority::High, DrainOutcome::Drained)]);
    }

    #[tokio::test]
    async fn stuck_pool_is_reported_as_forced() {
        let pool = WorkerPool::new(Priority::Low, NonZeroUsize::new(1).unwrap());
        let stuck = pool.submit(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, crate::error::DeliveryError>(())
        });
        let coordinator =
            ShutdownCoordinator::new(Duration::from_secs(1), Duration::from_millis(30));

        let report = coordinator
            .shutdown(ConsumerRegistry::new(), &[pool])
            .await;

        assert!(!report.is_clean());
        assert_eq!(
            report.pools,
            vec![(Priority::Low, DrainOutcome::Forced { abandoned: 1 })]
        );
        assert!(stuck.await.expect("joined").is_err());
    }
}
