//! Kubernetes Operator Runtime
//!
//! Base runtime for writing Kubernetes operators: watches resource types,
//! funnels every change notification into one strictly ordered dispatch queue,
//! drives a finalizer-based deletion protocol and writes status and finalizers
//! back with optimistic concurrency.
//!
//! # Example
//!
//! ```no_run
//! use operator_runtime::{
//!     event_handler, OperatorConfig, OperatorRuntime, ResourceEvent, ResourceTarget, ResourceWriter,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let runtime = OperatorRuntime::new(OperatorConfig::from_env()?).await?;
//! let writer = runtime.writer();
//!
//! runtime.watch_resource(
//!     ResourceTarget::new("example.com", "v1", "widgets"),
//!     event_handler(move |event: ResourceEvent| {
//!         let writer = writer.clone();
//!         async move {
//!             writer.patch_status(&event.meta, json!({ "seen": true })).await;
//!             Ok(())
//!         }
//!     }),
//! );
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! - **Total order**: handlers run one at a time, in the order notifications
//!   arrived, across all watched resource types
//! - **Reconnect**: a watch that ends cleanly is reopened on the same path
//! - **Fail fast**: a watch error terminates the process (see [`FatalHandler`])
//! - **Optimistic concurrency**: every write carries the observed `resourceVersion`

pub mod auth;
pub mod config;
pub mod crd;
pub mod error;
pub mod finalizer;
pub mod meta;
pub mod operator;
pub mod queue;
pub mod status;
pub mod watcher;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use auth::{cluster_config, AuthBridge, Credentials};
pub use config::OperatorConfig;
pub use crd::{CrdRegistrar, CrdRegistration};
pub use error::OperatorError;
pub use finalizer::{DeleteAction, FinalizerCoordinator, FinalizerState};
pub use meta::{EventType, ResourceEvent, ResourceMeta, ResourceMetaResolver, ResourceTarget};
pub use operator::{Operator, OperatorRuntime};
pub use queue::{event_handler, EventDispatchQueue, EventHandler};
pub use status::{ResourceWriter, StatusPatcher};
pub use watcher::{FatalHandler, KubeWatchSource, WatchManager, WatchNotification, WatchSource};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockResourceWriter, ScriptedWatchSource};
