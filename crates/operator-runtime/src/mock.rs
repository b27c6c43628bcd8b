//! Test doubles for unit testing operators
//!
//! - [`MockResourceWriter`] records status and finalizer writes in memory.
//! - [`ScriptedWatchSource`] replays prepared watch connections.
//! - [`serve_once`] runs an axum server that answers one request and returns
//!   what it saw.

use crate::error::OperatorError;
use crate::meta::ResourceMeta;
use crate::status::{finalizers_body, status_body, ResourceWriter};
use crate::watcher::{NotificationStream, WatchNotification, WatchSource};
use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Kind of a recorded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// PUT status
    SetStatus,
    /// PATCH status
    PatchStatus,
    /// PATCH finalizers
    SetFinalizers,
}

/// One recorded write, with the body a real writer would send.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCall {
    /// Which operation was called
    pub kind: WriteKind,
    /// Meta passed by the caller
    pub meta: ResourceMeta,
    /// Request body
    pub body: Value,
}

/// In-memory [`ResourceWriter`].
#[derive(Debug, Clone, Default)]
pub struct MockResourceWriter {
    calls: Arc<Mutex<Vec<WriteCall>>>,
    failing: Arc<AtomicBool>,
}

impl MockResourceWriter {
    /// Creates a writer whose writes succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write return `None`, as a rejected write would.
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Writes recorded so far.
    pub fn calls(&self) -> Vec<WriteCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, kind: WriteKind, meta: &ResourceMeta, body: Value) -> Option<Value> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(WriteCall {
            kind,
            meta: meta.clone(),
            body: body.clone(),
        });
        if self.failing.load(Ordering::SeqCst) {
            None
        } else {
            Some(body)
        }
    }
}

#[async_trait]
impl ResourceWriter for MockResourceWriter {
    async fn set_status(&self, meta: &ResourceMeta, status: Value) -> Option<Value> {
        self.record(WriteKind::SetStatus, meta, status_body(meta, status))
    }

    async fn patch_status(&self, meta: &ResourceMeta, status: Value) -> Option<Value> {
        self.record(WriteKind::PatchStatus, meta, status_body(meta, status))
    }

    async fn set_finalizers(&self, meta: &ResourceMeta, finalizers: Vec<String>) -> Option<Value> {
        self.record(WriteKind::SetFinalizers, meta, finalizers_body(meta, &finalizers))
    }
}

enum Script {
    Stream {
        items: Vec<Result<WatchNotification, OperatorError>>,
        hang: bool,
    },
    OpenError(String),
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`WatchSource`] replaying prepared connections in order.
///
/// Once the script runs out, further opens hang without items.
#[derive(Default)]
pub struct ScriptedWatchSource {
    scripts: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<(Instant, String)>>,
    live: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ScriptedWatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedWatchSource")
            .field("opens", &self.opens.lock().unwrap_or_else(PoisonError::into_inner).len())
            .field("live", &self.live_connections())
            .finish()
    }
}

impl ScriptedWatchSource {
    /// Creates a source with no prepared connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next connection yields `items`, then ends cleanly.
    pub fn push_closing(&self, items: Vec<Result<WatchNotification, OperatorError>>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Script::Stream { items, hang: false });
    }

    /// Next connection yields `items`, then stays open.
    pub fn push_hanging(&self, items: Vec<Result<WatchNotification, OperatorError>>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Script::Stream { items, hang: true });
    }

    /// Next open fails.
    pub fn push_open_error(&self, reason: &str) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Script::OpenError(reason.to_string()));
    }

    /// Every open so far, with the time it happened and the path.
    pub fn opens(&self) -> Vec<(Instant, String)> {
        self.opens.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Connections opened and not yet dropped.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WatchSource for ScriptedWatchSource {
    async fn open(&self, path: &str) -> Result<NotificationStream, OperatorError> {
        self.opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Instant::now(), path.to_string()));
        let script = self.scripts.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let (items, hang) = match script {
            Some(Script::Stream { items, hang }) => (items, hang),
            Some(Script::OpenError(reason)) => {
                return Err(OperatorError::WatchTerminal {
                    id: path.to_string(),
                    reason,
                });
            }
            None => (Vec::new(), true),
        };

        let guard = LiveGuard::new(self.live.clone());
        let items = stream::iter(items);
        let base = if hang {
            items.chain(stream::pending()).boxed()
        } else {
            items.boxed()
        };
        Ok(base
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed())
    }
}

/// A request captured by [`serve_once`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method
    pub method: String,
    /// Request target (path and query)
    pub path: String,
    /// Headers with lowercased names
    pub headers: Vec<(String, String)>,
    /// Raw body
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First header value with this (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body parsed as JSON (`Null` if it is not JSON).
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

struct Capture {
    status: StatusCode,
    body: String,
    seen: Mutex<Option<RecordedRequest>>,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

async fn record(
    State(capture): State<Arc<Capture>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let request = RecordedRequest {
        method: method.to_string(),
        path: uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), ToString::to_string),
        headers: headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect(),
        body: body.to_vec(),
    };
    capture
        .seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_or_insert(request);
    if let Some(done) = capture.done.lock().unwrap_or_else(PoisonError::into_inner).take() {
        let _ = done.send(());
    }
    (
        capture.status,
        [(header::CONTENT_TYPE, "application/json"), (header::CONNECTION, "close")],
        capture.body.clone(),
    )
}

/// Serves a single request on localhost with a fixed status and JSON body.
///
/// Returns the base URL and a handle resolving to the captured request once
/// the response has been sent and the server has shut down.
pub async fn serve_once(
    status: u16,
    body: &str,
) -> io::Result<(String, JoinHandle<io::Result<RecordedRequest>>)> {
    let status =
        StatusCode::from_u16(status).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}", listener.local_addr()?);

    let (done_tx, done_rx) = oneshot::channel();
    let capture = Arc::new(Capture {
        status,
        body: body.to_string(),
        seen: Mutex::new(None),
        done: Mutex::new(Some(done_tx)),
    });
    let router = Router::new().fallback(record).with_state(Arc::clone(&capture));

    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = done_rx.await;
            })
            .await?;
        capture
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "server stopped before a request"))
    });

    Ok((url, handle))
}
