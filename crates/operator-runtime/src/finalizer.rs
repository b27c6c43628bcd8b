//! Finalizer-based deletion protocol.
//!
//! A resource carrying our finalizer cannot disappear until we remove it, which
//! gives the delete action a chance to clean up external state first. Because
//! every event goes through the single dispatch queue, the read-modify-write of
//! the finalizer list here never races with another handler.

use crate::meta::{EventType, ResourceEvent};
use crate::queue::HandlerFuture;
use crate::status::ResourceWriter;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Boxed cleanup action, for callers that store it per registration.
pub type DeleteAction = Box<dyn FnOnce(ResourceEvent) -> HandlerFuture + Send>;

/// Where a resource stands with respect to one finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// Live object without our finalizer
    Missing,
    /// Live object already holding our finalizer
    Held,
    /// Object being deleted while we still hold the finalizer
    Cleanup,
    /// Object being deleted, our finalizer already gone
    Released,
}

impl FinalizerState {
    /// Classifies an event for `finalizer`.
    pub fn of(event: &ResourceEvent, finalizer: &str) -> Self {
        let held = event.finalizers().iter().any(|f| f == finalizer);
        match (event.deletion_timestamp().is_some(), held) {
            (false, false) => FinalizerState::Missing,
            (false, true) => FinalizerState::Held,
            (true, true) => FinalizerState::Cleanup,
            (true, false) => FinalizerState::Released,
        }
    }
}

/// Adds, honours and removes a finalizer on watched resources.
#[derive(Clone)]
pub struct FinalizerCoordinator {
    writer: Arc<dyn ResourceWriter>,
}

impl std::fmt::Debug for FinalizerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerCoordinator").finish_non_exhaustive()
    }
}

impl FinalizerCoordinator {
    /// Creates a coordinator writing through `writer`.
    pub fn new(writer: Arc<dyn ResourceWriter>) -> Self {
        Self { writer }
    }

    /// Drives the finalizer protocol for one event.
    ///
    /// Returns `Ok(true)` when the event was consumed by the protocol (the
    /// finalizer was just added, or the object is being deleted) and `Ok(false)`
    /// when the caller should run its normal reconciliation.
    ///
    /// If `delete_action` fails, its error is returned and the finalizer stays,
    /// so the next event for the object retries the cleanup.
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
        if event.event_type == EventType::Deleted || event.object.get("metadata").is_none() {
            return Ok(false);
        }

        let meta = &event.meta;
        match FinalizerState::of(event, finalizer) {
            FinalizerState::Missing => {
                let mut finalizers = event.finalizers();
                finalizers.push(finalizer.to_string());
                debug!("Adding finalizer {} to {} {}", finalizer, meta.kind, meta.name);
                if self.writer.set_finalizers(meta, finalizers).await.is_none() {
                    warn!("Could not add finalizer {} to {}", finalizer, meta.name);
                }
                Ok(true)
            }
            FinalizerState::Held => Ok(false),
            FinalizerState::Cleanup => {
                info!("Running delete action for {} {}", meta.kind, meta.name);
                delete_action(event.clone()).await?;

                let remaining: Vec<String> = event
                    .finalizers()
                    .into_iter()
                    .filter(|f| f != finalizer)
                    .collect();
                if self.writer.set_finalizers(meta, remaining).await.is_none() {
                    warn!("Could not remove finalizer {} from {}", finalizer, meta.name);
                }
                Ok(true)
            }
            FinalizerState::Released => Ok(true),
        }
    }
}
