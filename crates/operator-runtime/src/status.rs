//! Status and finalizer writes.
//!
//! Writes go through a `reqwest` client authenticated by the [`AuthBridge`],
//! separate from the watch connection. Every write carries the
//! `resourceVersion` the caller observed, so the API server rejects writes
//! based on a stale read. Conflicts are not retried: the next watch event
//! brings the fresh object.

use crate::auth::AuthBridge;
use crate::error::OperatorError;
use crate::meta::{ResourceMeta, ResourceMetaResolver};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Request};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// JSON merge patch (RFC 7386) content type.
pub const MERGE_PATCH: &str = "application/merge-patch+json";

/// Writes status and finalizers back to the API server.
///
/// Implementations never fail: errors are logged and reported as `None`, so
/// the single dispatch loop stays alive.
#[async_trait]
pub trait ResourceWriter: Send + Sync {
    /// Replaces the status subresource (PUT).
    async fn set_status(&self, meta: &ResourceMeta, status: Value) -> Option<Value>;

    /// Merge-patches the status subresource (PATCH); only keys present in
    /// `status` change server-side.
    async fn patch_status(&self, meta: &ResourceMeta, status: Value) -> Option<Value>;

    /// Merge-patches `metadata.finalizers` on the resource itself.
    async fn set_finalizers(&self, meta: &ResourceMeta, finalizers: Vec<String>) -> Option<Value>;
}

/// Body of a status write.
pub fn status_body(meta: &ResourceMeta, status: Value) -> Value {
    let mut metadata = json!({
        "name": meta.name,
        "resourceVersion": meta.resource_version,
    });
    if let Some(namespace) = &meta.namespace {
        metadata["namespace"] = json!(namespace);
    }
    json!({
        "apiVersion": meta.api_version,
        "kind": meta.kind,
        "metadata": metadata,
        "status": status,
    })
}

/// Body of a finalizer write.
pub fn finalizers_body(meta: &ResourceMeta, finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": meta.resource_version,
        }
    })
}

#[derive(Debug, Clone, Copy)]
enum StatusWrite {
    /// PUT
    Replace,
    /// Merge PATCH
    Merge,
}

/// [`ResourceWriter`] talking to the API server over HTTP.
#[derive(Debug, Clone)]
pub struct StatusPatcher {
    client: Client,
    auth: Arc<AuthBridge>,
    resolver: Arc<ResourceMetaResolver>,
}

impl StatusPatcher {
    /// Creates a patcher using `client`, which should come from
    /// [`AuthBridge::build_client`] so it trusts the cluster CA.
    pub fn new(client: Client, auth: Arc<AuthBridge>, resolver: Arc<ResourceMetaResolver>) -> Self {
        Self {
            client,
            auth,
            resolver,
        }
    }

    fn status_request(
        &self,
        write: StatusWrite,
        meta: &ResourceMeta,
        status: Value,
    ) -> Result<Request, OperatorError> {
        let path = self.resolver.status_path(meta)?;
        let body = status_body(meta, status);
        let builder = match write {
            StatusWrite::Replace => self.client.put(self.auth.url(&path)).json(&body),
            StatusWrite::Merge => self
                .client
                .patch(self.auth.url(&path))
                .header(CONTENT_TYPE, MERGE_PATCH)
                .body(serde_json::to_vec(&body)?),
        };
        Ok(self.auth.apply(builder).header(ACCEPT, "application/json").build()?)
    }

    /// Builds a finalizer merge patch.
    fn finalizers_request(
        &self,
        meta: &ResourceMeta,
        finalizers: &[String],
    ) -> Result<Request, OperatorError> {
        let path = self.resolver.resource_path(meta)?;
        let body = finalizers_body(meta, finalizers);
        Ok(self
            .auth
            .apply(self.client.patch(self.auth.url(&path)))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(serde_json::to_vec(&body)?)
            .build()?)
    }

    async fn send(&self, request: Request) -> Result<Value, OperatorError> {
        let method = request.method().clone();
        let path = request.url().path().to_string();
        debug!("{} {}", method, path);

        let response = self.client.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OperatorError::WriteFailure {
                path,
                reason: format!("{} - {}", status, body),
            });
        }
        Ok(response.json().await?)
    }

    async fn write(&self, what: &str, meta: &ResourceMeta, request: Result<Request, OperatorError>) -> Option<Value> {
        let outcome = match request {
            Ok(request) => self.send(request).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(object) => Some(object),
            Err(e) => {
                error!(
                    "Failed to {} for {} {} (resourceVersion {}): {}",
                    what, meta.kind, meta.name, meta.resource_version, e
                );
                None
            }
        }
    }
}

#[async_trait]
impl ResourceWriter for StatusPatcher {
    async fn set_status(&self, meta: &ResourceMeta, status: Value) -> Option<Value> {
        let request = self.status_request(StatusWrite::Replace, meta, status);
        self.write("set status", meta, request).await
    }

    async fn patch_status(&self, meta: &ResourceMeta, status: Value) -> Option<Value> {
        let request = self.status_request(StatusWrite::Merge, meta, status);
        self.write("patch status", meta, request).await
    }

    async fn set_finalizers(&self, meta: &ResourceMeta, finalizers: Vec<String>) -> Option<Value> {
        let request = self.finalizers_request(meta, &finalizers);
        self.write("set finalizers", meta, request).await
    }
}
