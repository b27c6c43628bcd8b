//! Reconciliation logic for Greeting CRDs.
//!
//! Every Greeting gets the cleanup finalizer on first sight. Live Greetings
//! have their message acknowledged in status; deleted ones say goodbye
//! before the finalizer is released.

use crate::error::ControllerError;
use crds::{Greeting, GreetingPhase, GREETING_FINALIZER};
use operator_runtime::{EventType, FinalizerCoordinator, ResourceEvent, ResourceWriter};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reconciles Greeting resources.
pub struct Reconciler {
    writer: Arc<dyn ResourceWriter>,
    finalizers: FinalizerCoordinator,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(writer: Arc<dyn ResourceWriter>, finalizers: FinalizerCoordinator) -> Self {
        Self { writer, finalizers }
    }

    /// Handles one Greeting event.
    pub async fn handle(&self, event: ResourceEvent) -> anyhow::Result<()> {
        let name = &event.meta.name;
        if event.event_type == EventType::Deleted {
            debug!("Greeting {} is gone", name);
            return Ok(());
        }

        let consumed = self
            .finalizers
            .handle_finalizer(&event, GREETING_FINALIZER, |deleted| async move {
                self.farewell(&deleted)?;
                Ok(())
            })
            .await?;
        if consumed {
            return Ok(());
        }

        self.reconcile(&event).await?;
        Ok(())
    }

    /// Acknowledges the current message in status.
    ///
    /// Skips the write when status already reflects the message, so our own
    /// status update does not trigger another one.
    pub async fn reconcile(&self, event: &ResourceEvent) -> Result<(), ControllerError> {
        let greeting = decode(event)?;
        let message = &greeting.spec.message;

        if let Some(status) = &greeting.status {
            if status.phase == GreetingPhase::Ready
                && status.observed_message.as_deref() == Some(message.as_str())
            {
                debug!("Greeting {} already acknowledged", event.meta.name);
                return Ok(());
            }
        }

        let times = greeting.spec.replicas.unwrap_or(1);
        info!("Greeting {} says {:?} x{}", event.meta.name, message, times);

        let status = json!({ "phase": GreetingPhase::Ready, "observedMessage": message });
        if self.writer.patch_status(&event.meta, status).await.is_none() {
            warn!("Status of Greeting {} not updated, waiting for the next event", event.meta.name);
        }
        Ok(())
    }

    fn farewell(&self, event: &ResourceEvent) -> Result<(), ControllerError> {
        let greeting = decode(event)?;
        info!("Goodbye from Greeting {} ({:?})", event.meta.name, greeting.spec.message);
        Ok(())
    }
}

fn decode(event: &ResourceEvent) -> Result<Greeting, ControllerError> {
    serde_json::from_value(event.object.clone()).map_err(|e| ControllerError::InvalidSpec {
        name: event.meta.name.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use operator_runtime::mock::{MockResourceWriter, WriteKind};
    use serde_json::Value;

    fn greeting(finalizers: &[&str], status: Option<Value>, deleting: bool) -> Value {
        let mut object = json!({
            "apiVersion": "samples.kube-operator.dev/v1alpha1",
            "kind": "Greeting",
            "metadata": {
                "name": "hello",
                "namespace": "default",
                "resourceVersion": "11",
                "finalizers": finalizers,
            },
            "spec": { "message": "hello world" }
        });
        if let Some(status) = status {
            object["status"] = status;
        }
        if deleting {
            object["metadata"]["deletionTimestamp"] = json!("2024-05-01T10:00:00Z");
        }
        object
    }

    fn event(event_type: EventType, object: Value) -> ResourceEvent {
        ResourceEvent::new(event_type, object, "greetings.samples.kube-operator.dev/v1alpha1").unwrap()
    }

    fn reconciler() -> (Reconciler, MockResourceWriter) {
        let writer = MockResourceWriter::new();
        let shared: Arc<dyn ResourceWriter> = Arc::new(writer.clone());
        (Reconciler::new(shared.clone(), FinalizerCoordinator::new(shared)), writer)
    }

    #[tokio::test]
    async fn test_new_greeting_gets_finalizer_only() {
        let (reconciler, writer) = reconciler();
        reconciler
            .handle(event(EventType::Added, greeting(&[], None, false)))
            .await
            .unwrap();

        let calls = writer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, WriteKind::SetFinalizers);
        assert_eq!(calls[0].body["metadata"]["finalizers"], json!([GREETING_FINALIZER]));
    }

    #[tokio::test]
    async fn test_finalized_greeting_is_acknowledged() {
        let (reconciler, writer) = reconciler();
        reconciler
            .handle(event(EventType::Modified, greeting(&[GREETING_FINALIZER], None, false)))
            .await
            .unwrap();

        let calls = writer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, WriteKind::PatchStatus);
        assert_eq!(
            calls[0].body["status"],
            json!({ "phase": "Ready", "observedMessage": "hello world" })
        );
        assert_eq!(calls[0].body["metadata"]["resourceVersion"], "11");
    }

    #[tokio::test]
    async fn test_acknowledged_greeting_is_left_alone() {
        let (reconciler, writer) = reconciler();
        let status = json!({ "phase": "Ready", "observedMessage": "hello world" });
        reconciler
            .handle(event(EventType::Modified, greeting(&[GREETING_FINALIZER], Some(status), false)))
            .await
            .unwrap();
        assert!(writer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_changed_message_is_acknowledged_again() {
        let (reconciler, writer) = reconciler();
        let status = json!({ "phase": "Ready", "observedMessage": "old message" });
        reconciler
            .handle(event(EventType::Modified, greeting(&[GREETING_FINALIZER], Some(status), false)))
            .await
            .unwrap();
        assert_eq!(writer.calls()[0].body["status"]["observedMessage"], "hello world");
    }

    #[tokio::test]
    async fn test_deletion_releases_only_our_finalizer() {
        let (reconciler, writer) = reconciler();
        reconciler
            .handle(event(
                EventType::Modified,
                greeting(&["other.io/keep", GREETING_FINALIZER], None, true),
            ))
            .await
            .unwrap();

        let calls = writer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, WriteKind::SetFinalizers);
        assert_eq!(calls[0].body["metadata"]["finalizers"], json!(["other.io/keep"]));
    }

    #[tokio::test]
    async fn test_invalid_spec_keeps_finalizer_on_deletion() {
        let (reconciler, writer) = reconciler();
        let mut object = greeting(&[GREETING_FINALIZER], None, true);
        object["spec"] = json!({ "message": 42 });

        let err = reconciler.handle(event(EventType::Modified, object)).await.unwrap_err();
        assert!(err.to_string().contains("Invalid Greeting hello"));
        assert!(writer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_event_is_ignored() {
        let (reconciler, writer) = reconciler();
        reconciler
            .handle(event(EventType::Deleted, greeting(&[], None, true)))
            .await
            .unwrap();
        assert!(writer.calls().is_empty());
    }
}
