//! In-process object store used by tests and `--memory-store` dev mode.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use crate::models::{Kind, Labels};

use super::{
    merge_delete, merge_update, prepare_create, Merged, ObjectRef, ObjectStore, RawObject,
    StoreError, UpdateScope,
};

type Key = (Kind, String, String);

pub struct MemoryStore {
    objects: Mutex<HashMap<Key, RawObject>>,
    events: broadcast::Sender<ObjectRef>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            objects: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn notify(&self, kind: Kind, namespace: &str, name: &str) {
        // no receivers is fine
        let _ = self.events.send(ObjectRef::new(kind, namespace, name));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(kind: Kind, namespace: &str, name: &str) -> Key {
    (kind, namespace.to_string(), name.to_string())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> Result<RawObject, StoreError> {
        self.objects
            .lock()
            .await
            .get(&key(kind, namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found(kind, namespace, name))
    }

    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<RawObject>, StoreError> {
        let objects = self.objects.lock().await;
        let mut matching: Vec<RawObject> = objects
            .iter()
            .filter(|((k, ns, _), object)| {
                *k == kind && ns == namespace && object.metadata.matches(selector)
            })
            .map(|(_, object)| object.clone())
            .collect();
        matching.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(matching)
    }

    async fn create(&self, kind: Kind, object: RawObject) -> Result<RawObject, StoreError> {
        let object = prepare_create(object, Utc::now());
        let meta = &object.metadata;
        let k = key(kind, &meta.namespace, &meta.name);

        let mut objects = self.objects.lock().await;
        if objects.contains_key(&k) {
            return Err(StoreError::already_exists(kind, &meta.namespace, &meta.name));
        }
        objects.insert(k, object.clone());
        drop(objects);

        self.notify(kind, &object.metadata.namespace, &object.metadata.name);
        Ok(object)
    }

    async fn update(
        &self,
        kind: Kind,
        object: RawObject,
        scope: UpdateScope,
    ) -> Result<Option<RawObject>, StoreError> {
        let (namespace, name) = (
            object.metadata.namespace.clone(),
            object.metadata.name.clone(),
        );
        let k = key(kind, &namespace, &name);

        let mut objects = self.objects.lock().await;
        let stored = objects
            .get(&k)
            .ok_or_else(|| StoreError::not_found(kind, &namespace, &name))?;

        let result = match merge_update(kind, stored, object, scope)? {
            Merged::Write(merged) => {
                objects.insert(k, merged.clone());
                Some(merged)
            }
            Merged::Remove => {
                objects.remove(&k);
                None
            }
        };
        drop(objects);

        self.notify(kind, &namespace, &name);
        Ok(result)
    }

    async fn delete(
        &self,
        kind: Kind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RawObject>, StoreError> {
        let k = key(kind, namespace, name);

        let mut objects = self.objects.lock().await;
        let stored = objects
            .get(&k)
            .ok_or_else(|| StoreError::not_found(kind, namespace, name))?;

        let result = match merge_delete(stored, Utc::now()) {
            Merged::Write(marked) => {
                objects.insert(k, marked.clone());
                Some(marked)
            }
            Merged::Remove => {
                objects.remove(&k);
                None
            }
        };
        drop(objects);

        self.notify(kind, namespace, name);
        Ok(result)
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectRef> {
        self.events.subscribe()
    }
}
