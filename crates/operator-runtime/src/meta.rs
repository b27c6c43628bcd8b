//! Resource identity and REST paths.
//!
//! Every watched resource type is registered once with a [`ResourceTarget`]
//! (group, version, plural, optional namespace). The resulting id and path
//! builder are what later ties a watch notification back to the endpoints
//! used for status and finalizer writes.

use crate::error::OperatorError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Builds the collection path of a resource type for an optional namespace.
///
/// `None` yields the cluster-wide collection, e.g. `/apis/example.com/v1/widgets`.
pub type PathBuilder = Arc<dyn Fn(Option<&str>) -> String + Send + Sync>;

/// Registration-time coordinates of a watched resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTarget {
    /// API group; empty for the core group
    pub group: String,
    /// API version, e.g. `v1`
    pub version: String,
    /// Plural resource name, e.g. `widgets`
    pub plural: String,
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Explicit resource-type id; defaults to `plural.apiVersion`
    pub id: Option<String>,
}

impl ResourceTarget {
    /// Creates a cluster-wide target.
    pub fn new(group: impl Into<String>, version: impl Into<String>, plural: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            plural: plural.into(),
            namespace: None,
            id: None,
        }
    }

    /// Creates a target from a statically typed kube resource.
    pub fn of<K>() -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Self::new(K::group(&()), K::version(&()), K::plural(&()))
    }

    /// Restricts the watch to a namespace (`None` keeps it cluster-wide).
    #[must_use]
    pub fn in_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Overrides the default resource-type id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Resource-type id shared by every event of this type.
    pub fn id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.plural, self.api_version()))
    }

    /// Path builder closing over group, version and plural.
    pub fn path_builder(&self) -> PathBuilder {
        let prefix = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        let plural = self.plural.clone();
        Arc::new(move |namespace| match namespace {
            Some(ns) => format!("{prefix}/namespaces/{ns}/{plural}"),
            None => format!("{prefix}/{plural}"),
        })
    }
}

/// Identity of one observed resource instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMeta {
    /// metadata.name
    pub name: String,
    /// metadata.namespace, absent for cluster-scoped resources
    pub namespace: Option<String>,
    /// Resource-type id this instance was observed under
    pub id: String,
    /// metadata.resourceVersion at observation time
    pub resource_version: String,
    /// apiVersion
    pub api_version: String,
    /// kind
    pub kind: String,
}

impl ResourceMeta {
    /// Extracts identity fields from a raw object.
    ///
    /// Fails on the first missing required field; never returns a partial meta.
    pub fn from_object(object: &Value, id: &str) -> Result<Self, OperatorError> {
        let missing = |field| OperatorError::MalformedEvent {
            id: id.to_string(),
            field,
        };
        let metadata = object.get("metadata");
        let meta_str = |key: &str| {
            metadata
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let top_str = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);

        let name = meta_str("name").ok_or_else(|| missing("metadata.name"))?;
        let resource_version =
            meta_str("resourceVersion").ok_or_else(|| missing("metadata.resourceVersion"))?;
        let api_version = top_str("apiVersion").ok_or_else(|| missing("apiVersion"))?;
        let kind = top_str("kind").ok_or_else(|| missing("kind"))?;

        Ok(Self {
            name,
            namespace: meta_str("namespace"),
            id: id.to_string(),
            resource_version,
            api_version,
            kind,
        })
    }
}

/// Watch notification phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Object was created (or listed on a fresh connection)
    Added,
    /// Object was changed
    Modified,
    /// Object was removed
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => write!(f, "ADDED"),
            EventType::Modified => write!(f, "MODIFIED"),
            EventType::Deleted => write!(f, "DELETED"),
        }
    }
}

/// One decoded change notification, as handed to event handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    /// Identity of the object
    pub meta: ResourceMeta,
    /// Notification phase
    pub event_type: EventType,
    /// Full observed body, including spec and status
    pub object: Value,
}

impl ResourceEvent {
    /// Builds an event from a raw notification object.
    pub fn new(event_type: EventType, object: Value, id: &str) -> Result<Self, OperatorError> {
        let meta = ResourceMeta::from_object(&object, id)?;
        Ok(Self {
            meta,
            event_type,
            object,
        })
    }

    /// `metadata.deletionTimestamp`, if set.
    pub fn deletion_timestamp(&self) -> Option<&str> {
        self.object
            .pointer("/metadata/deletionTimestamp")
            .and_then(Value::as_str)
    }

    /// `metadata.finalizers` in server order.
    pub fn finalizers(&self) -> Vec<String> {
        self.object
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `spec`, if present.
    pub fn spec(&self) -> Option<&Value> {
        self.object.get("spec")
    }

    /// `status`, if present.
    pub fn status(&self) -> Option<&Value> {
        self.object.get("status")
    }
}

/// Resolves resource identities and the REST paths used for writes.
#[derive(Default)]
pub struct ResourceMetaResolver {
    builders: RwLock<HashMap<String, PathBuilder>>,
}

impl fmt::Debug for ResourceMetaResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let builders = self.builders.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ResourceMetaResolver")
            .field("ids", &builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceMetaResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the path builder for a resource-type id, replacing any previous one.
    pub fn register_path_builder(&self, id: impl Into<String>, builder: PathBuilder) {
        self.builders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), builder);
    }

    /// Registers a target under its id and returns that id.
    pub fn register(&self, target: &ResourceTarget) -> String {
        let id = target.id();
        self.register_path_builder(id.clone(), target.path_builder());
        id
    }

    /// Returns the path builder registered for `id`.
    pub fn path_builder(&self, id: &str) -> Option<PathBuilder> {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Extracts a [`ResourceMeta`] from a raw object observed under `id`.
    pub fn resolve(&self, object: &Value, id: &str) -> Result<ResourceMeta, OperatorError> {
        ResourceMeta::from_object(object, id)
    }

    /// Collection path for the instance's namespace.
    pub fn base_path(&self, meta: &ResourceMeta) -> Result<String, OperatorError> {
        let builder = self
            .path_builder(&meta.id)
            .ok_or_else(|| OperatorError::UnknownResource(meta.id.clone()))?;
        Ok(builder(meta.namespace.as_deref()))
    }

    /// Path of the instance itself.
    pub fn resource_path(&self, meta: &ResourceMeta) -> Result<String, OperatorError> {
        Ok(format!("{}/{}", self.base_path(meta)?, meta.name))
    }

    /// Path of the instance's status subresource.
    pub fn status_path(&self, meta: &ResourceMeta) -> Result<String, OperatorError> {
        Ok(format!("{}/status", self.resource_path(meta)?))
    }
}
