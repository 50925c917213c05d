use kube::Client;
use tracing::{error, info};

#[cfg(test)]
pub mod fake;
pub mod store;

pub use store::{KubeStore, ObjectStore, StoreError, WriteOutcome};

pub async fn start_kubernetes_client() -> Result<Client, kube::Error> {
    let client = Client::try_default()
        .await
        .inspect_err(|err| error!("Failed to create Kubernetes client: {}", err))?;

    info!(
        "Connected to Kubernetes, default namespace {}",
        client.default_namespace()
    );
    Ok(client)
}
