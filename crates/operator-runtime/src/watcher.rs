//! Kubernetes resource watchers.
//!
//! One long-lived connection per registered resource type. Decoded
//! notifications are pushed onto the shared [`EventDispatchQueue`]; the
//! connection loop never waits for handlers.
//!
//! Reconnect policy:
//! - the stream closes without error: reconnect to the same path after a fixed delay
//! - the stream reports an error (or cannot be opened): fatal, handed to the
//!   [`FatalHandler`], which terminates the process in production. A watch that
//!   failed may have missed events, and resuming it safely would need a full resync.

use crate::error::OperatorError;
use crate::meta::{EventType, ResourceEvent, ResourceMetaResolver, ResourceTarget};
use crate::queue::{EventDispatchQueue, EventHandler};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::WatchEvent;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Default delay before reopening a watch that ended cleanly.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// One decoded item of a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchNotification {
    /// ADDED / MODIFIED / DELETED with the full object
    Event(EventType, Value),
    /// Progress marker without object content
    Bookmark,
    /// ERROR object sent by the API server
    Error(String),
}

/// Stream of notifications for one open connection. `None` means a clean end.
pub type NotificationStream = BoxStream<'static, Result<WatchNotification, OperatorError>>;

/// Opens watch connections.
///
/// Abstracts the API server so the reconnect logic can be tested with
/// scripted streams.
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Opens `GET {path}?watch=true`.
    async fn open(&self, path: &str) -> Result<NotificationStream, OperatorError>;
}

/// [`WatchSource`] backed by a `kube::Client`.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: kube::Client,
}

impl std::fmt::Debug for KubeWatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWatchSource").finish_non_exhaustive()
    }
}

impl KubeWatchSource {
    /// Creates a watch source on an existing client.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    async fn open(&self, path: &str) -> Result<NotificationStream, OperatorError> {
        let request = http::Request::get(format!("{path}?watch=true"))
            .body(Vec::new())
            .map_err(|e| OperatorError::WatchTerminal {
                id: path.to_string(),
                reason: e.to_string(),
            })?;
        let events = self.client.request_events::<Value>(request).await?;

        Ok(events
            .map(|item| match item {
                Ok(WatchEvent::Added(object)) => Ok(WatchNotification::Event(EventType::Added, object)),
                Ok(WatchEvent::Modified(object)) => {
                    Ok(WatchNotification::Event(EventType::Modified, object))
                }
                Ok(WatchEvent::Deleted(object)) => {
                    Ok(WatchNotification::Event(EventType::Deleted, object))
                }
                Ok(WatchEvent::Bookmark(_)) => Ok(WatchNotification::Bookmark),
                Ok(WatchEvent::Error(e)) => Ok(WatchNotification::Error(format!(
                    "{} ({}): {}",
                    e.reason, e.code, e.message
                ))),
                Err(e) => Err(OperatorError::Kube(e)),
            })
            .boxed())
    }
}

/// Receives unrecoverable watch errors.
pub type FatalHandler = Arc<dyn Fn(OperatorError) + Send + Sync>;

/// Production [`FatalHandler`]: logs and exits with status 1 so a supervisor
/// restarts the operator with a clean view of the cluster.
pub fn exit_process() -> FatalHandler {
    Arc::new(|e| {
        error!("Terminating operator: {}", e);
        std::process::exit(1);
    })
}

/// Opens and maintains one watch connection per resource type.
pub struct WatchManager {
    source: Arc<dyn WatchSource>,
    resolver: Arc<ResourceMetaResolver>,
    queue: EventDispatchQueue,
    fatal: FatalHandler,
    reconnect_delay: Duration,
    connections: Mutex<HashMap<String, AbortHandle>>,
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("watched", &self.watched_ids())
            .field("reconnect_delay", &self.reconnect_delay)
            .finish_non_exhaustive()
    }
}

impl WatchManager {
    /// Creates a watch manager feeding `queue`.
    pub fn new(
        source: Arc<dyn WatchSource>,
        resolver: Arc<ResourceMetaResolver>,
        queue: EventDispatchQueue,
        fatal: FatalHandler,
    ) -> Self {
        Self {
            source,
            resolver,
            queue,
            fatal,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the delay before reconnecting after a clean stream end.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Starts watching a resource type and returns its id.
    ///
    /// Watching an id that is already watched replaces the previous connection.
    pub fn watch(&self, target: &ResourceTarget, handler: EventHandler) -> String {
        let id = self.resolver.register(target);
        let path = (target.path_builder())(target.namespace.as_deref());
        info!("Starting {} watcher on {}", id, path);

        let connection = Connection {
            id: id.clone(),
            path,
            handler,
            source: self.source.clone(),
            queue: self.queue.clone(),
            fatal: self.fatal.clone(),
            reconnect_delay: self.reconnect_delay,
        };
        let task = tokio::spawn(connection.run());

        let previous = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), task.abort_handle());
        if let Some(previous) = previous {
            debug!("Replacing existing watch for {}", id);
            previous.abort();
        }
        id
    }

    /// Aborts every open connection. Already queued events keep draining.
    pub fn stop(&self) {
        let connections: Vec<_> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, handle) in connections {
            info!("Stopping {} watcher", id);
            handle.abort();
        }
    }

    /// Ids with a registered connection.
    pub fn watched_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

struct Connection {
    id: String,
    path: String,
    handler: EventHandler,
    source: Arc<dyn WatchSource>,
    queue: EventDispatchQueue,
    fatal: FatalHandler,
    reconnect_delay: Duration,
}

impl Connection {
    async fn run(self) {
        loop {
            debug!("Opening watch {}?watch=true", self.path);
            let mut stream = match self.source.open(&self.path).await {
                Ok(stream) => stream,
                Err(e) => return self.terminate(e.to_string()),
            };

            while let Some(item) = stream.next().await {
                match item {
                    Ok(WatchNotification::Event(event_type, object)) => {
                        match ResourceEvent::new(event_type, object, &self.id) {
                            Ok(event) => self.queue.enqueue(event, self.handler.clone()),
                            Err(e) => warn!("Skipping {} notification: {}", event_type, e),
                        }
                    }
                    Ok(WatchNotification::Bookmark) => debug!("Bookmark on {}", self.id),
                    Ok(WatchNotification::Error(reason)) => return self.terminate(reason),
                    Err(e) => return self.terminate(e.to_string()),
                }
            }

            info!(
                "Watch on {} ended, reconnecting in {:?}",
                self.id, self.reconnect_delay
            );
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    fn terminate(&self, reason: String) {
        error!("Watch on {} failed: {}", self.id, reason);
        (self.fatal)(OperatorError::WatchTerminal {
            id: self.id.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedWatchSource;
    use crate::queue::event_handler;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn widget(name: &str, rv: &str) -> WatchNotification {
        WatchNotification::Event(
            EventType::Added,
            json!({
                "apiVersion": "example.com/v1",
                "kind": "Widget",
                "metadata": { "name": name, "namespace": "default", "resourceVersion": rv }
            }),
        )
    }

    fn recording_fatal() -> (FatalHandler, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let fatal: FatalHandler = Arc::new(move |e| sink.lock().unwrap().push(e.to_string()));
        (fatal, log)
    }

    fn counting_handler() -> (EventHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = event_handler(move |event: ResourceEvent| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.meta.name);
                Ok(())
            }
        });
        (handler, seen)
    }

    async fn wait_for_opens(source: &ScriptedWatchSource, n: usize) {
        while source.opens().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_benign_end_reconnects_to_same_path_after_delay() {
        let source = Arc::new(ScriptedWatchSource::new());
        source.push_closing(vec![Ok(widget("a", "1")), Ok(widget("b", "2"))]);
        source.push_hanging(vec![]);

        let queue = EventDispatchQueue::start();
        let (fatal, fatal_log) = recording_fatal();
        let manager = WatchManager::new(
            source.clone(),
            Arc::new(ResourceMetaResolver::new()),
            queue.clone(),
            fatal,
        );
        let (handler, seen) = counting_handler();

        let target = ResourceTarget::new("example.com", "v1", "widgets")
            .in_namespace(Some("default".to_string()));
        manager.watch(&target, handler);

        wait_for_opens(&source, 2).await;
        queue.wait_idle().await;

        let opens = source.opens();
        assert_eq!(opens[0].1, "/apis/example.com/v1/namespaces/default/widgets");
        assert_eq!(opens[1].1, opens[0].1);
        let gap = opens[1].0 - opens[0].0;
        assert!(gap >= Duration::from_millis(200), "reconnected too early: {gap:?}");
        assert!(gap < Duration::from_millis(250), "reconnected too late: {gap:?}");

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(fatal_log.lock().unwrap().is_empty());
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_notification_is_fatal_and_not_retried() {
        let source = Arc::new(ScriptedWatchSource::new());
        source.push_hanging(vec![
            Ok(widget("a", "1")),
            Ok(WatchNotification::Error("Expired (410): too old resource version".into())),
            Ok(widget("never", "3")),
        ]);

        let queue = EventDispatchQueue::start();
        let (fatal, fatal_log) = recording_fatal();
        let manager = WatchManager::new(
            source.clone(),
            Arc::new(ResourceMetaResolver::new()),
            queue.clone(),
            fatal,
        );
        let (handler, seen) = counting_handler();
        let id = manager.watch(&ResourceTarget::new("example.com", "v1", "widgets"), handler);

        while fatal_log.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.wait_idle().await;

        assert_eq!(source.opens().len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
        let log = fatal_log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].contains(&id));
        assert!(log[0].contains("410"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_fatal() {
        let source = Arc::new(ScriptedWatchSource::new());
        source.push_open_error("connection refused");

        let (fatal, fatal_log) = recording_fatal();
        let manager = WatchManager::new(
            source.clone(),
            Arc::new(ResourceMetaResolver::new()),
            EventDispatchQueue::start(),
            fatal,
        );
        let (handler, _) = counting_handler();
        manager.watch(&ResourceTarget::new("", "v1", "configmaps"), handler);

        while fatal_log.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(fatal_log.lock().unwrap()[0].contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_notification_is_skipped() {
        let source = Arc::new(ScriptedWatchSource::new());
        source.push_hanging(vec![
            Ok(WatchNotification::Event(
                EventType::Modified,
                json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x" } }),
            )),
            Ok(WatchNotification::Bookmark),
            Ok(widget("ok", "5")),
        ]);

        let queue = EventDispatchQueue::start();
        let (fatal, fatal_log) = recording_fatal();
        let manager = WatchManager::new(
            source.clone(),
            Arc::new(ResourceMetaResolver::new()),
            queue.clone(),
            fatal,
        );
        let (handler, seen) = counting_handler();
        manager.watch(&ResourceTarget::new("example.com", "v1", "widgets"), handler);

        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["ok".to_string()]);
        assert!(fatal_log.lock().unwrap().is_empty());
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_connections_but_queued_events_drain() {
        let source = Arc::new(ScriptedWatchSource::new());
        source.push_hanging(vec![Ok(widget("a", "1")), Ok(widget("b", "2"))]);

        let queue = EventDispatchQueue::start();
        let (fatal, _) = recording_fatal();
        let manager = WatchManager::new(
            source.clone(),
            Arc::new(ResourceMetaResolver::new()),
            queue.clone(),
            fatal,
        );

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let slow = event_handler(move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        manager.watch(&ResourceTarget::new("example.com", "v1", "widgets"), slow);

        while queue.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(source.live_connections(), 1);

        manager.stop();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(manager.watched_ids().is_empty());
        assert_eq!(source.live_connections(), 0);

        queue.wait_idle().await;
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewatching_same_id_replaces_connection() {
        let source = Arc::new(ScriptedWatchSource::new());
        source.push_hanging(vec![]);
        source.push_hanging(vec![]);

        let (fatal, _) = recording_fatal();
        let manager = WatchManager::new(
            source.clone(),
            Arc::new(ResourceMetaResolver::new()),
            EventDispatchQueue::start(),
            fatal,
        );
        let target = ResourceTarget::new("example.com", "v1", "widgets");
        let (handler, _) = counting_handler();
        manager.watch(&target, handler.clone());
        wait_for_opens(&source, 1).await;
        manager.watch(&target, handler);
        wait_for_opens(&source, 2).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(manager.watched_ids(), vec!["widgets.example.com/v1".to_string()]);
        assert_eq!(source.live_connections(), 1);
        manager.stop();
    }
}
