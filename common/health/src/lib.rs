use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness reporting for the long-running loops of a service.
///
/// Every consumer instance registers itself as a component and must keep
/// reporting before its deadline. The process status combines them:
///   - no component registered yet: unhealthy
///   - any component unhealthy, or silent past its deadline: unhealthy
///   - every component failed: unhealthy
///   - every component recently healthy, cleanly stopped or failed: healthy
///
/// A component that reaches its terminal state on purpose (e.g. a consumer
/// drained during shutdown) reports `Stopped` so the probe doesn't flag it
/// as stalled while the rest of the process winds down. One that ended on an
/// error of its own reports `Failed`: its siblings keep the process useful,
/// so it doesn't fail the probe either.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy, stopped or failed, and not all failed
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Maps the overall status to 200/500 and dumps each component in the body.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the instant
    HealthyUntil(Instant),
    /// Reported unhealthy
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
    /// Component exited on purpose and won't report again
    Stopped,
    /// Component ended on its own error and won't report again
    Failed,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline))
            .await
    }

    /// Report that the component exited cleanly.
    pub async fn report_stopped(&self) {
        self.report_status(ComponentStatus::Stopped).await
    }

    /// Report that the component ended on an error the rest of the process survives.
    pub async fn report_failed(&self) {
        self.report_status(ComponentStatus::Failed).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Must be called from within a tokio runtime, the registry spawns its receiving task.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(64);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    // Poisoned lock: the probes will fail and the process restart
                    warn!("poisoned HealthRegistry lock")
                }
            }
        });

        registry
    }

    /// Registers a new component. The returned handle is passed to the component
    /// so it can report on its own schedule.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall process status, computed from every registered component.
    /// Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let mut result = HealthStatus {
            healthy: !components.is_empty(), // unhealthy if nothing registered yet
            components: HashMap::with_capacity(components.len()),
        };
        let now = Instant::now();

        for (name, status) in components.iter() {
            let effective = match status {
                ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(
                effective,
                ComponentStatus::HealthyUntil(_) | ComponentStatus::Stopped | ComponentStatus::Failed
            ) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), effective);
        }

        if components
            .values()
            .all(|status| *status == ComponentStatus::Failed)
        {
            result.healthy = false;
        }

        match result.healthy {
            true => debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn one_component() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry
            .register("high-priority-mails-0".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("high-priority-mails-0"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("high-priority-mails-0"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn silent_component_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("low-priority-mails-3".to_string(), Duration::from_secs(30))
            .await;

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        let past = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .expect("monotonic clock is past its first second");
        handle
            .report_status(ComponentStatus::HealthyUntil(past))
            .await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("low-priority-mails-3"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn stopped_components_do_not_fail_the_probe() {
        let registry = HealthRegistry::new("liveness");
        let running = registry
            .register("one".to_string(), Duration::from_secs(30))
            .await;
        let stopping = registry
            .register("two".to_string(), Duration::from_secs(30))
            .await;

        running.report_healthy().await;
        stopping.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        stopping.report_stopped().await;
        assert_or_retry(|| {
            registry.get_status().components.get("two") == Some(&ComponentStatus::Stopped)
        })
        .await;
        assert!(registry.get_status().healthy);

        running.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn failed_component_does_not_fail_its_siblings() {
        let registry = HealthRegistry::new("liveness");
        let broken = registry
            .register("low-priority-mails-0".to_string(), Duration::from_secs(30))
            .await;
        let sibling = registry
            .register("low-priority-mails-1".to_string(), Duration::from_secs(30))
            .await;

        sibling.report_healthy().await;
        broken.report_failed().await;
        assert_or_retry(|| {
            registry.get_status().components.get("low-priority-mails-0")
                == Some(&ComponentStatus::Failed)
        })
        .await;
        assert!(registry.get_status().healthy);

        sibling.report_failed().await;
        assert_or_retry(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
