//! Single ordered event dispatch queue.
//!
//! All watched resource types feed one FIFO queue drained by one worker task,
//! so handlers run strictly one at a time and in enqueue order. Handlers can
//! therefore read-modify-write a resource (status, finalizers) without locking.
//!
//! The queue is unbounded: enqueue never blocks, and a slow handler makes the
//! queue grow without limit. [`EventDispatchQueue::len`] exposes the backlog.

use crate::meta::ResourceEvent;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

/// Future returned by an [`EventHandler`].
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Caller-supplied event handler, stored per watch registration.
pub type EventHandler = Arc<dyn Fn(ResourceEvent) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(ResourceEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

struct Dispatch {
    event: ResourceEvent,
    handler: EventHandler,
}

/// Handle to the dispatch queue. Clones share the same queue and worker.
///
/// The worker exits once every handle has been dropped and the backlog is drained.
#[derive(Clone)]
pub struct EventDispatchQueue {
    tx: mpsc::UnboundedSender<Dispatch>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl std::fmt::Debug for EventDispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatchQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl EventDispatchQueue {
    /// Creates the queue and spawns its worker on the current Tokio runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());
        tokio::spawn(drain(rx, pending.clone(), idle.clone()));
        Self { tx, pending, idle }
    }

    /// Appends an event to the queue. Never blocks.
    pub fn enqueue(&self, event: ResourceEvent, handler: EventHandler) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(rejected) = self.tx.send(Dispatch { event, handler }) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(
                "Dispatch worker is gone, dropping {} event for {}",
                rejected.0.event.event_type, rejected.0.event.meta.name
            );
        }
    }

    /// Events enqueued but not yet fully handled.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// True when no event is queued or running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until every event enqueued so far has been handled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
) {
    while let Some(Dispatch { event, handler }) = rx.recv().await {
        let event_type = event.event_type;
        let id = event.meta.id.clone();
        let name = event.meta.name.clone();
        debug!("Dispatching {} {} ({})", event_type, name, id);

        let outcome = AssertUnwindSafe(async move { handler(event).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Handler failed for {} {} ({}): {:#}", event_type, name, id, e),
            Err(_) => error!("Handler panicked for {} {} ({})", event_type, name, id),
        }

        if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            idle.notify_waiters();
        }
    }
    debug!("Dispatch queue closed");
}
