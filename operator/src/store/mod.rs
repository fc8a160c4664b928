//! Object store: typed CRUD with optimistic concurrency and deletion guards.
//!
//! Backends implement [`ObjectStore`] over raw records (metadata plus an
//! untyped body). The merge rules every backend must honour live here so the
//! in-memory and PostgreSQL stores cannot drift apart:
//!
//! - create assigns a uid, the creation timestamp and resource version 1;
//! - update requires the caller's resource version to match the stored one;
//! - a main update keeps the stored status, a status update keeps everything
//!   but the status;
//! - the deletion timestamp is only ever set by delete and never cleared;
//! - a deleting object whose last finalizer is removed disappears;
//! - deleting an object that still has finalizers only stamps the timestamp.

pub mod api;
pub mod memory;
pub mod migration;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Kind, ObjectMeta, Resource};

pub use api::{Api, DeleteOutcome};
pub use memory::MemoryStore;
pub use postgres::PgStore;

const STATUS_FIELD: &str = "status";
const METADATA_FIELD: &str = "metadata";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: Kind,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: Kind,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} was modified concurrently")]
    Conflict {
        kind: Kind,
        namespace: String,
        name: String,
    },

    #[error("record encoding: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: Kind, namespace: &str, name: &str) -> Self {
        StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: Kind, namespace: &str, name: &str) -> Self {
        StoreError::AlreadyExists {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn conflict(kind: Kind, namespace: &str, name: &str) -> Self {
        StoreError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// A stored record: metadata plus every other top-level field of the kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    pub metadata: ObjectMeta,
    pub body: Map<String, Value>,
}

impl RawObject {
    pub fn from_resource<K: Resource>(resource: &K) -> Result<Self, StoreError> {
        let mut body = match serde_json::to_value(resource)? {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Backend(format!(
                    "{} did not encode as an object: {other}",
                    K::KIND
                )))
            }
        };
        body.remove(METADATA_FIELD);
        Ok(Self {
            metadata: resource.meta().clone(),
            body,
        })
    }

    pub fn into_resource<K: Resource>(self) -> Result<K, StoreError> {
        let mut body = self.body;
        body.insert(
            METADATA_FIELD.to_string(),
            serde_json::to_value(&self.metadata)?,
        );
        Ok(serde_json::from_value(Value::Object(body))?)
    }
}

/// Which part of a record an update may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateScope {
    /// Metadata and spec; the stored status is kept.
    Main,
    /// Status only.
    Status,
}

/// Result of applying an update or delete to a stored record.
#[derive(Debug, Clone, PartialEq)]
pub enum Merged {
    /// Write this record, guarded by the previous resource version.
    Write(RawObject),
    /// Remove the record, guarded by the previous resource version.
    Remove,
}

/// Identifies a written record; sent to watchers after every change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: Kind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> Result<RawObject, StoreError>;

    /// Every record of `kind` in `namespace` carrying all `selector` labels.
    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &crate::models::Labels,
    ) -> Result<Vec<RawObject>, StoreError>;

    async fn create(&self, kind: Kind, object: RawObject) -> Result<RawObject, StoreError>;

    /// Returns `None` when the update released the last finalizer of a
    /// deleting record and it was removed.
    async fn update(
        &self,
        kind: Kind,
        object: RawObject,
        scope: UpdateScope,
    ) -> Result<Option<RawObject>, StoreError>;

    /// Returns `None` when the record was removed, or the record with its
    /// deletion timestamp set when finalizers still guard it.
    async fn delete(
        &self,
        kind: Kind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RawObject>, StoreError>;

    /// Change notifications for records written through this store.
    fn subscribe(&self) -> broadcast::Receiver<ObjectRef>;
}

// ── Merge rules ──

/// Stamp server-owned metadata onto a record about to be created.
pub fn prepare_create(mut object: RawObject, now: DateTime<Utc>) -> RawObject {
    object.metadata.uid = Some(Uuid::new_v4());
    object.metadata.resource_version = 1;
    object.metadata.creation_timestamp = Some(now);
    object.metadata.deletion_timestamp = None;
    object
}

/// Apply `incoming` on top of `stored` under `scope`.
pub fn merge_update(
    kind: Kind,
    stored: &RawObject,
    incoming: RawObject,
    scope: UpdateScope,
) -> Result<Merged, StoreError> {
    let meta = &stored.metadata;
    if incoming.metadata.resource_version != meta.resource_version {
        return Err(StoreError::conflict(kind, &meta.namespace, &meta.name));
    }

    let mut merged = match scope {
        UpdateScope::Main => {
            let mut body = incoming.body;
            match stored.body.get(STATUS_FIELD) {
                Some(status) => {
                    body.insert(STATUS_FIELD.to_string(), status.clone());
                }
                None => {
                    body.remove(STATUS_FIELD);
                }
            }
            let mut metadata = incoming.metadata;
            metadata.name = meta.name.clone();
            metadata.namespace = meta.namespace.clone();
            metadata.uid = meta.uid;
            metadata.creation_timestamp = meta.creation_timestamp;
            metadata.deletion_timestamp = meta.deletion_timestamp;
            RawObject { metadata, body }
        }
        UpdateScope::Status => {
            let mut body = stored.body.clone();
            match incoming.body.get(STATUS_FIELD) {
                Some(status) => {
                    body.insert(STATUS_FIELD.to_string(), status.clone());
                }
                None => {
                    body.remove(STATUS_FIELD);
                }
            }
            RawObject {
                metadata: meta.clone(),
                body,
            }
        }
    };

    if merged.metadata.is_deleting() && merged.metadata.finalizers.is_empty() {
        return Ok(Merged::Remove);
    }
    merged.metadata.resource_version = meta.resource_version + 1;
    Ok(Merged::Write(merged))
}

/// Deleting a record removes it unless finalizers guard it.
pub fn merge_delete(stored: &RawObject, now: DateTime<Utc>) -> Merged {
    if stored.metadata.finalizers.is_empty() {
        return Merged::Remove;
    }
    let mut marked = stored.clone();
    if marked.metadata.deletion_timestamp.is_none() {
        marked.metadata.deletion_timestamp = Some(now);
    }
    marked.metadata.resource_version += 1;
    Merged::Write(marked)
}
