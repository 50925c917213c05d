#![warn(
    clippy::pedantic,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::needless_pass_by_value,
    clippy::needless_continue,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::struct_field_names
)]

mod cli;
mod controllers;
mod events;
mod kubernetes;
mod options;

use crate::controllers::{SpawnControllersParams, spawn_controllers};
use crate::kubernetes::start_kubernetes_client;
use ces_discovery_core::crypto::init_crypto;
use ces_discovery_core::instrumentation::init_instrumentation;
use ces_discovery_core::task::Builder as TaskBuilder;
use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MainError {
    #[error("Failed to start Kubernetes client: {0}")]
    Kubernetes(#[from] kube::Error),
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), MainError> {
    let args = Cli::parse();
    let options = Arc::new(args.options());

    init_crypto();
    init_instrumentation();

    let task_builder = TaskBuilder::default();

    let client = start_kubernetes_client().await?;

    info!("Watching namespace {}", args.namespace());
    spawn_controllers(
        &task_builder,
        SpawnControllersParams::builder()
            .options(options)
            .client(client)
            .namespace(args.namespace())
            .instance(args.pod_name().clone())
            .build(),
    );

    task_builder.join_all().await;

    Ok(())
}
