//! Greeting Controller
//!
//! Sample operator built on the operator runtime.
//!
//! This controller registers the `Greeting` CRD, holds a cleanup finalizer on
//! every Greeting and acknowledges each message in the resource status.

mod controller;
mod error;
mod reconciler;

use controller::GreetingOperator;
use operator_runtime::{Operator, OperatorConfig, OperatorRuntime};
use std::env;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Both kube and reqwest use rustls; pick one crypto provider for the process.
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Greeting Controller");

    // Load configuration from environment variables
    let config = OperatorConfig::from_env()?;
    let crd_manifest = env::var("GREETING_CRD_MANIFEST").ok().map(PathBuf::from);

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Reconnect delay: {:?}", config.reconnect_delay);
    info!("  Write timeout: {:?}", config.write_timeout);
    if let Some(path) = &crd_manifest {
        info!("  CRD manifest: {}", path.display());
    }

    let runtime = OperatorRuntime::new(config).await?;
    let operator = GreetingOperator::new(runtime, crd_manifest);
    operator.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining queued events");
    operator.stop();
    operator.runtime().queue().wait_idle().await;
    info!("Greeting Controller stopped");

    Ok(())
}
