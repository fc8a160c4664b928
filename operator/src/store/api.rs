//! Typed, namespaced access to one record kind.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::models::{Labels, Resource};

use super::{ObjectStore, RawObject, StoreError, UpdateScope};

/// What a delete request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Finalizers still guard the record; its deletion timestamp is set.
    Finalizing,
    NotFound,
}

pub struct Api<K> {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> Api<K> {
    pub fn namespaced(store: Arc<dyn ObjectStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            _kind: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.store
            .get(K::KIND, &self.namespace, name)
            .await?
            .into_resource()
    }

    pub async fn get_opt(&self, name: &str) -> Result<Option<K>, StoreError> {
        match self.get(name).await {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, selector: &Labels) -> Result<Vec<K>, StoreError> {
        self.store
            .list(K::KIND, &self.namespace, selector)
            .await?
            .into_iter()
            .map(RawObject::into_resource)
            .collect()
    }

    pub async fn create(&self, resource: &K) -> Result<K, StoreError> {
        let mut raw = RawObject::from_resource(resource)?;
        raw.metadata.namespace = self.namespace.clone();
        self.store.create(K::KIND, raw).await?.into_resource()
    }

    /// Replace metadata and spec. Returns `None` if the record was removed
    /// because its last finalizer was released during deletion.
    pub async fn replace(&self, resource: &K) -> Result<Option<K>, StoreError> {
        let raw = RawObject::from_resource(resource)?;
        self.store
            .update(K::KIND, raw, UpdateScope::Main)
            .await?
            .map(RawObject::into_resource)
            .transpose()
    }

    pub async fn replace_status(&self, resource: &K) -> Result<K, StoreError> {
        let raw = RawObject::from_resource(resource)?;
        match self.store.update(K::KIND, raw, UpdateScope::Status).await? {
            Some(raw) => raw.into_resource(),
            None => Err(StoreError::not_found(
                K::KIND,
                &self.namespace,
                resource.name(),
            )),
        }
    }

    /// Create the record, or overwrite metadata and spec of the existing one.
    pub async fn create_or_replace(&self, resource: &K) -> Result<K, StoreError> {
        let Some(existing) = self.get_opt(resource.name()).await? else {
            return self.create(resource).await;
        };
        let mut desired = resource.clone();
        let meta = desired.meta_mut();
        meta.resource_version = existing.meta().resource_version;
        meta.finalizers = existing.meta().finalizers.clone();
        self.replace(&desired).await?.ok_or_else(|| {
            StoreError::not_found(K::KIND, &self.namespace, resource.name())
        })
    }

    pub async fn delete(&self, name: &str) -> Result<DeleteOutcome, StoreError> {
        match self.store.delete(K::KIND, &self.namespace, name).await {
            Ok(Some(_)) => Ok(DeleteOutcome::Finalizing),
            Ok(None) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.is_not_found() => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::instance::{GitTarget, Phase};
    use crate::models::Instance;
    use crate::store::MemoryStore;
    use crate::testing;

    fn api() -> Api<Instance> {
        Api::namespaced(Arc::new(MemoryStore::new()), "previews")
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let api = api();
        let env = testing::environment("owner-1", "org", "repo");
        let instance = testing::instance(&env, GitTarget::PullRequestNumber(1), "");

        let created = api.create(&instance).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.resource_version, 1);
        assert_eq!(created.metadata.namespace, "previews");

        assert!(matches!(
            api.create(&instance).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn stale_writers_lose() {
        let api = api();
        let env = testing::environment("owner-1", "org", "repo");
        let created = api
            .create(&testing::instance(&env, GitTarget::PullRequestNumber(1), ""))
            .await
            .unwrap();

        let mut first = created.clone();
        first.status.phase = Phase::Building;
        api.replace_status(&first).await.unwrap();

        let mut second = created;
        second.status.phase = Phase::Failed;
        assert!(matches!(
            api.replace_status(&second).await,
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(
            api.get(first.name()).await.unwrap().status.phase,
            Phase::Building
        );
    }

    #[tokio::test]
    async fn finalizers_delay_removal() {
        let api = api();
        let env = testing::environment("owner-1", "org", "repo");
        let mut instance = testing::instance(&env, GitTarget::Branch("main".into()), "");
        instance.metadata.add_finalizer("guard");
        let name = instance.metadata.name.clone();
        api.create(&instance).await.unwrap();

        assert_eq!(api.delete(&name).await.unwrap(), DeleteOutcome::Finalizing);
        let mut deleting = api.get(&name).await.unwrap();
        assert!(deleting.metadata.is_deleting());

        deleting.metadata.remove_finalizer("guard");
        assert!(api.replace(&deleting).await.unwrap().is_none());
        assert!(api.get_opt(&name).await.unwrap().is_none());
        assert_eq!(api.delete(&name).await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn create_or_replace_overwrites_spec() {
        let api = api();
        let env = testing::environment("owner-1", "org", "repo");
        let instance = testing::instance(&env, GitTarget::Branch("main".into()), "a");
        api.create_or_replace(&instance).await.unwrap();

        let mut changed = instance.clone();
        changed.spec.instance_git_settings.commit_hash = "b".into();
        let stored = api.create_or_replace(&changed).await.unwrap();
        assert_eq!(stored.commit_hash(), "b");
        assert_eq!(stored.metadata.resource_version, 2);
    }
}
