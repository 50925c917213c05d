use crate::kubernetes::{ObjectStore, StoreError};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("Failed to fetch deployment {name}: {source}")]
    Fetch {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("Deployment {name} not found")]
    NotFound { name: String },
    #[error("Deployment {name} did not become ready within {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Answers readiness queries for dogu deployments and waits for them to
/// become ready.
#[derive(Clone)]
pub struct DeploymentReadinessWatcher {
    deployments: Arc<dyn ObjectStore<Deployment>>,
}

impl DeploymentReadinessWatcher {
    pub fn new(deployments: Arc<dyn ObjectStore<Deployment>>) -> Self {
        Self { deployments }
    }

    /// A deployment is ready once at least one replica reports ready.
    pub async fn is_ready(&self, name: &str) -> Result<bool, ReadinessError> {
        let deployment = self
            .deployments
            .get(name)
            .await
            .map_err(|source| ReadinessError::Fetch {
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| ReadinessError::NotFound {
                name: name.to_string(),
            })?;

        let ready_replicas = deployment
            .status
            .and_then(|status| status.ready_replicas)
            .unwrap_or_default();
        Ok(ready_replicas > 0)
    }

    /// Resolves once `name` is ready, invoking `on_ready` first. Cancellation
    /// resolves successfully without invoking the callback. Change
    /// notifications are backed by polling every `poll_interval` (at least
    /// 100ms), which also covers a closed subscription.
    pub async fn wait_for_ready<F, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        poll_interval: Duration,
        cancellation_token: CancellationToken,
        on_ready: F,
    ) -> Result<(), ReadinessError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self.is_ready(name).await? {
            on_ready().await;
            return Ok(());
        }

        let mut changes = self.deployments.watch(name);
        let mut subscribed = true;

        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        let mut poll = interval(poll_interval.max(MIN_POLL_INTERVAL));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.reset();

        loop {
            tokio::select! {
                biased;

                () = &mut deadline => {
                    return Err(ReadinessError::Timeout {
                        name: name.to_string(),
                        timeout,
                    });
                }
                () = cancellation_token.cancelled() => {
                    debug!("Stopped waiting for deployment {} to become ready", name);
                    return Ok(());
                }
                change = changes.next(), if subscribed => {
                    if change.is_none() {
                        debug!("Change subscription for deployment {} closed, polling only", name);
                        subscribed = false;
                        continue;
                    }
                }
                _ = poll.tick() => {}
            }

            if self.is_ready(name).await? {
                info!("Deployment {} is ready", name);
                on_ready().await;
                return Ok(());
            }
        }
    }
}
