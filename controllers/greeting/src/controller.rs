//! Main controller implementation.
//!
//! `GreetingOperator` owns the operator runtime, registers the Greeting CRD and
//! routes Greeting events to the [`Reconciler`].

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use async_trait::async_trait;
use crds::Greeting;
use kube::CustomResourceExt;
use operator_runtime::{
    event_handler, CrdRegistration, Operator, OperatorRuntime, ResourceEvent, ResourceTarget,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Operator managing Greeting resources.
#[derive(Debug)]
pub struct GreetingOperator {
    runtime: OperatorRuntime,
    reconciler: Arc<Reconciler>,
    crd_manifest: Option<PathBuf>,
}

impl GreetingOperator {
    /// Creates the operator. With `crd_manifest` set, the CRD is registered
    /// from that file instead of the compiled-in definition.
    pub fn new(runtime: OperatorRuntime, crd_manifest: Option<PathBuf>) -> Self {
        let reconciler = Arc::new(Reconciler::new(runtime.writer(), runtime.finalizers()));
        Self {
            runtime,
            reconciler,
            crd_manifest,
        }
    }

    /// Registers the Greeting CRD.
    pub async fn register_crd(&self) -> Result<CrdRegistration, ControllerError> {
        let registration = match &self.crd_manifest {
            Some(path) => {
                info!("Registering Greeting CRD from {}", path.display());
                self.runtime.register_custom_resource_from_file(path).await?
            }
            None => self.runtime.register_custom_resource(&Greeting::crd()).await?,
        };
        Ok(registration)
    }

    /// Starts the Greeting watch and returns its id.
    pub fn watch_greetings(&self) -> String {
        let reconciler = self.reconciler.clone();
        self.runtime.watch_resource(
            ResourceTarget::of::<Greeting>(),
            event_handler(move |event: ResourceEvent| {
                let reconciler = reconciler.clone();
                async move { reconciler.handle(event).await }
            }),
        )
    }
}

#[async_trait]
impl Operator for GreetingOperator {
    fn runtime(&self) -> &OperatorRuntime {
        &self.runtime
    }

    async fn init(&self) -> anyhow::Result<()> {
        let crd = self.register_crd().await?;
        info!("Greeting CRD serves {}/{:?}", crd.group, crd.versions);
        let id = self.watch_greetings();
        info!("Watching {}", id);
        Ok(())
    }
}
