//! Operator runtime and lifecycle.
//!
//! [`OperatorRuntime`] wires the watch path (a `kube::Client`) and the write
//! path (`reqwest` through the [`AuthBridge`]) around one shared resolver and
//! one dispatch queue. Concrete controllers own a runtime and implement
//! [`Operator`] to register their watches in [`Operator::init`].

use crate::auth::{cluster_config, AuthBridge};
use crate::config::OperatorConfig;
use crate::crd::{CrdRegistrar, CrdRegistration};
use crate::error::OperatorError;
use crate::finalizer::FinalizerCoordinator;
use crate::meta::{ResourceEvent, ResourceMeta, ResourceMetaResolver, ResourceTarget};
use crate::queue::{EventDispatchQueue, EventHandler};
use crate::status::{ResourceWriter, StatusPatcher};
use crate::watcher::{exit_process, FatalHandler, KubeWatchSource, WatchManager, WatchSource};
use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Shared machinery of a running operator.
pub struct OperatorRuntime {
    config: OperatorConfig,
    resolver: Arc<ResourceMetaResolver>,
    queue: EventDispatchQueue,
    watches: WatchManager,
    writer: Arc<dyn ResourceWriter>,
    finalizers: FinalizerCoordinator,
    crds: Option<CrdRegistrar>,
}

impl std::fmt::Debug for OperatorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRuntime")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("watches", &self.watches)
            .finish_non_exhaustive()
    }
}

impl OperatorRuntime {
    /// Connects to the cluster described by `config`.
    ///
    /// The cluster configuration is resolved once (see [`cluster_config`]) and
    /// shared by the watch client and the write client. Watch errors terminate
    /// the process.
    pub async fn new(config: OperatorConfig) -> Result<Self, OperatorError> {
        let kube_config = cluster_config(config.kubeconfig.as_deref()).await?;
        let auth = Arc::new(AuthBridge::from_kube_config(&kube_config)?);
        let http = auth.build_client(config.write_timeout)?;
        let client = kube::Client::try_from(kube_config)?;

        let resolver = Arc::new(ResourceMetaResolver::new());
        let writer = Arc::new(StatusPatcher::new(http.clone(), auth.clone(), resolver.clone()));
        let runtime = Self::with_parts(
            config,
            resolver,
            Arc::new(KubeWatchSource::new(client)),
            writer,
            exit_process(),
        );
        Ok(runtime.with_crd_registrar(CrdRegistrar::new(auth, http)))
    }

    /// Assembles a runtime from explicit parts and starts its dispatch queue.
    ///
    /// Must be called inside a Tokio runtime. `resolver` should be the one the
    /// `writer` resolves paths with.
    pub fn with_parts(
        config: OperatorConfig,
        resolver: Arc<ResourceMetaResolver>,
        source: Arc<dyn WatchSource>,
        writer: Arc<dyn ResourceWriter>,
        fatal: FatalHandler,
    ) -> Self {
        let queue = EventDispatchQueue::start();
        let watches = WatchManager::new(source, resolver.clone(), queue.clone(), fatal)
            .with_reconnect_delay(config.reconnect_delay);
        let finalizers = FinalizerCoordinator::new(writer.clone());
        Self {
            config,
            resolver,
            queue,
            watches,
            writer,
            finalizers,
            crds: None,
        }
    }

    /// Enables CRD registration.
    #[must_use]
    pub fn with_crd_registrar(mut self, crds: CrdRegistrar) -> Self {
        self.crds = Some(crds);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Resolver shared by watches and writes.
    pub fn resolver(&self) -> Arc<ResourceMetaResolver> {
        self.resolver.clone()
    }

    /// Writer for use inside event handlers.
    pub fn writer(&self) -> Arc<dyn ResourceWriter> {
        self.writer.clone()
    }

    /// Finalizer coordinator for use inside event handlers.
    pub fn finalizers(&self) -> FinalizerCoordinator {
        self.finalizers.clone()
    }

    /// The dispatch queue.
    pub fn queue(&self) -> &EventDispatchQueue {
        &self.queue
    }

    /// Watches a resource type and returns its id.
    ///
    /// A target without a namespace falls back to the configured namespace.
    pub fn watch_resource(&self, target: ResourceTarget, handler: EventHandler) -> String {
        let namespace = target.namespace.clone().or_else(|| self.config.namespace.clone());
        self.watches.watch(&target.in_namespace(namespace), handler)
    }

    /// Registers a CRD. An already existing CRD counts as registered.
    pub async fn register_custom_resource(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CrdRegistration, OperatorError> {
        self.registrar(crd.metadata.name.as_deref())?.register(crd).await
    }

    /// Registers the CRD in the manifest at `path`.
    pub async fn register_custom_resource_from_file(
        &self,
        path: &Path,
    ) -> Result<CrdRegistration, OperatorError> {
        let name = path.display().to_string();
        self.registrar(Some(&name))?.register_from_file(path).await
    }

    fn registrar(&self, name: Option<&str>) -> Result<&CrdRegistrar, OperatorError> {
        self.crds.as_ref().ok_or_else(|| OperatorError::Crd {
            name: name.unwrap_or_default().to_string(),
            reason: "no API server configured for CRD registration".to_string(),
        })
    }

    /// Replaces the status subresource. `None` if the write failed.
    pub async fn set_status(&self, meta: &ResourceMeta, status: Value) -> Option<Value> {
        self.writer.set_status(meta, status).await
    }

    /// Merge-patches the status subresource. `None` if the write failed.
    pub async fn patch_status(&self, meta: &ResourceMeta, status: Value) -> Option<Value> {
        self.writer.patch_status(meta, status).await
    }

    /// Replaces `metadata.finalizers`. `None` if the write failed.
    pub async fn set_finalizers(&self, meta: &ResourceMeta, finalizers: Vec<String>) -> Option<Value> {
        self.writer.set_finalizers(meta, finalizers).await
    }

    /// See [`FinalizerCoordinator::handle_finalizer`].
    pub async fn handle_finalizer<F, Fut>(
        &self,
        event: &ResourceEvent,
        finalizer: &str,
        delete_action: F,
    ) -> anyhow::Result<bool>
    where
        F: FnOnce(ResourceEvent) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.finalizers
            .handle_finalizer(event, finalizer, delete_action)
            .await
    }

    /// Closes every watch. Events already queued are still handled; use
    /// [`EventDispatchQueue::wait_idle`] to wait for them.
    pub fn stop(&self) {
        info!("Stopping operator runtime");
        self.watches.stop();
    }
}

/// Lifecycle of a concrete operator.
#[async_trait]
pub trait Operator: Send + Sync {
    /// The runtime this operator drives.
    fn runtime(&self) -> &OperatorRuntime;

    /// Registers CRDs and watches.
    async fn init(&self) -> anyhow::Result<()>;

    /// Runs [`init`](Self::init).
    async fn start(&self) -> anyhow::Result<()> {
        info!("Starting operator");
        self.init().await?;
        info!("Operator started");
        Ok(())
    }

    /// Stops all watches.
    fn stop(&self) {
        self.runtime().stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::EventType;
    use crate::mock::{MockResourceWriter, ScriptedWatchSource, WriteKind};
    use crate::queue::event_handler;
    use crate::watcher::WatchNotification;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    const FINALIZER: &str = "widgets.example.com/cleanup";

    fn widget(name: &str, finalizers: &[&str]) -> WatchNotification {
        WatchNotification::Event(
            EventType::Added,
            json!({
                "apiVersion": "example.com/v1",
                "kind": "Widget",
                "metadata": {
                    "name": name,
                    "namespace": "team-a",
                    "resourceVersion": "3",
                    "finalizers": finalizers,
                },
                "spec": { "size": 2 }
            }),
        )
    }

    fn runtime(source: Arc<ScriptedWatchSource>, writer: MockResourceWriter) -> OperatorRuntime {
        let config = OperatorConfig {
            namespace: Some("team-a".to_string()),
            ..OperatorConfig::default()
        };
        let fatal: FatalHandler = Arc::new(|e| panic!("unexpected fatal error: {e}"));
        OperatorRuntime::with_parts(
            config,
            Arc::new(ResourceMetaResolver::new()),
            source,
            Arc::new(writer),
            fatal,
        )
    }

    struct WidgetOperator {
        runtime: OperatorRuntime,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Operator for WidgetOperator {
        fn runtime(&self) -> &OperatorRuntime {
            &self.runtime
        }

        async fn init(&self) -> anyhow::Result<()> {
            let writer = self.runtime.writer();
            let finalizers = self.runtime.finalizers();
            let seen = self.seen.clone();
            self.runtime.watch_resource(
                ResourceTarget::new("example.com", "v1", "widgets"),
                event_handler(move |event: ResourceEvent| {
                    let writer = writer.clone();
                    let finalizers = finalizers.clone();
                    let seen = seen.clone();
                    async move {
                        if finalizers
                            .handle_finalizer(&event, FINALIZER, |_| async { Ok(()) })
                            .await?
                        {
                            return Ok(());
                        }
                        seen.lock().unwrap().push(event.meta.name.clone());
                        writer.patch_status(&event.meta, json!({ "ready": true })).await;
                        Ok(())
                    }
                }),
            );
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_start_wires_watch_finalizer_and_status() {
        let source = Arc::new(ScriptedWatchSource::new());
        source.push_hanging(vec![Ok(widget("fresh", &[])), Ok(widget("held", &[FINALIZER]))]);
        let writer = MockResourceWriter::new();
        let operator = WidgetOperator {
            runtime: runtime(source.clone(), writer.clone()),
            seen: Arc::new(Mutex::new(Vec::new())),
        };

        operator.start().await.unwrap();
        while writer.calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        operator.runtime().queue().wait_idle().await;

        assert_eq!(source.opens()[0].1, "/apis/example.com/v1/namespaces/team-a/widgets");
        assert_eq!(*operator.seen.lock().unwrap(), vec!["held".to_string()]);

        let calls = writer.calls();
        assert_eq!(calls[0].kind, WriteKind::SetFinalizers);
        assert_eq!(calls[0].meta.name, "fresh");
        assert_eq!(calls[1].kind, WriteKind::PatchStatus);
        assert_eq!(calls[1].meta.name, "held");
        assert_eq!(calls[1].body["status"], json!({ "ready": true }));

        operator.stop();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(source.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_explicit_namespace_wins_over_config() {
        let source = Arc::new(ScriptedWatchSource::new());
        let runtime = runtime(source.clone(), MockResourceWriter::new());
        let target = ResourceTarget::new("", "v1", "configmaps").in_namespace(Some("other".to_string()));
        let id = runtime.watch_resource(target, event_handler(|_| async { Ok(()) }));

        while source.opens().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(id, "configmaps.v1");
        assert_eq!(source.opens()[0].1, "/api/v1/namespaces/other/configmaps");
        runtime.stop();
    }

    #[tokio::test]
    async fn test_crd_registration_needs_a_server() {
        let runtime = runtime(Arc::new(ScriptedWatchSource::new()), MockResourceWriter::new());
        let err = runtime
            .register_custom_resource_from_file(Path::new("widgets.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Crd { .. }));
    }
}
