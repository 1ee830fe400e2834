//! Generation Registry: which generation is current, and the transitions
//! that change it.
//!
//! `begin_install` → `commit_install` → `promote` → `reap`. At most one
//! generation is current, and `reap` refuses to run for anything but the
//! current one, so superseded generations are only deleted after their
//! replacement has been promoted.

use std::sync::Arc;

use hashbrown::HashSet;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::store::{CacheHandle, CacheStorage, GenerationId};
use crate::SwError;

#[derive(Debug, Default)]
struct RegistryState {
    current: Option<GenerationId>,
    installing: HashSet<GenerationId>,
    installed: HashSet<GenerationId>,
}

/// Tracks the current generation over a shared [`CacheStorage`].
pub struct GenerationRegistry {
    storage: Arc<dyn CacheStorage>,
    state: RwLock<RegistryState>,
}

impl GenerationRegistry {
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self {
            storage,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// The current generation, if any has been promoted.
    pub async fn current(&self) -> Option<GenerationId> {
        self.state.read().await.current.clone()
    }

    /// Handle to the current generation.
    pub async fn current_handle(&self) -> Option<CacheHandle> {
        self.current().await.map(CacheHandle::new)
    }

    /// Allocate a fresh generation for installing. Does not affect current.
    ///
    /// A leftover generation with the same id (an earlier failed or
    /// superseded install) is wiped first.
    pub async fn begin_install(&self, id: &GenerationId) -> Result<CacheHandle, SwError> {
        let mut state = self.state.write().await;
        if state.current.as_ref() == Some(id) {
            return Err(SwError::GenerationInUse(id.clone()));
        }

        if self.storage.delete(id).await? {
            debug!(generation = %id, "Wiped leftover generation before install");
        }
        state.installed.remove(id);
        state.installing.insert(id.clone());

        self.storage.open(id).await
    }

    /// Mark a populated generation as installed, making it promotable.
    pub async fn commit_install(&self, id: &GenerationId) -> Result<(), SwError> {
        let mut state = self.state.write().await;
        if !state.installing.remove(id) {
            return Err(SwError::StateError(format!(
                "generation {} is not being installed",
                id
            )));
        }
        state.installed.insert(id.clone());
        Ok(())
    }

    /// Drop a generation that is not current.
    pub async fn discard(&self, id: &GenerationId) -> Result<bool, SwError> {
        let mut state = self.state.write().await;
        if state.current.as_ref() == Some(id) {
            return Err(SwError::GenerationInUse(id.clone()));
        }
        state.installing.remove(id);
        state.installed.remove(id);
        self.storage.delete(id).await
    }

    /// Atomically make `id` the current generation. Returns the previous one.
    pub async fn promote(&self, id: &GenerationId) -> Result<Option<GenerationId>, SwError> {
        let mut state = self.state.write().await;
        if !state.installed.contains(id) {
            return Err(SwError::NotInstalled(id.clone()));
        }
        if !self.storage.contains(id).await? {
            state.installed.remove(id);
            return Err(SwError::GenerationAbsent(id.clone()));
        }

        let previous = state.current.replace(id.clone());
        info!(generation = %id, previous = ?previous.as_ref().map(|p| p.as_str()), "Generation promoted");
        Ok(previous)
    }

    /// Delete every generation except `except`, which must be current.
    ///
    /// Generations with an install in flight are left alone.
    pub async fn reap(&self, except: &GenerationId) -> Result<Vec<GenerationId>, SwError> {
        let mut state = self.state.write().await;
        if state.current.as_ref() != Some(except) {
            return Err(SwError::NotCurrent(except.clone()));
        }

        let mut deleted = Vec::new();
        for id in self.storage.generations().await? {
            if &id == except {
                continue;
            }
            if state.installing.contains(&id) {
                debug!(generation = %id, "Sparing generation with install in flight");
                continue;
            }
            if self.storage.delete(&id).await? {
                info!(generation = %id, "Deleted old cache generation");
                state.installed.remove(&id);
                deleted.push(id);
            }
        }
        Ok(deleted)
    }

    /// Re-adopt a generation already present in storage as current.
    ///
    /// Used when a persistent store outlives the process.
    pub async fn adopt(&self, id: &GenerationId) -> Result<(), SwError> {
        let mut state = self.state.write().await;
        if !self.storage.contains(id).await? {
            return Err(SwError::GenerationAbsent(id.clone()));
        }
        state.installed.insert(id.clone());
        state.current = Some(id.clone());
        info!(generation = %id, "Adopted existing generation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CacheEntry, MemoryCacheStorage, RequestKey};
    use bytes::Bytes;
    use url::Url;

    fn registry() -> GenerationRegistry {
        GenerationRegistry::new(Arc::new(MemoryCacheStorage::new()))
    }

    async fn installed(registry: &GenerationRegistry, id: &str) -> CacheHandle {
        let handle = registry.begin_install(&id.into()).await.unwrap();
        registry.commit_install(&id.into()).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_begin_install_does_not_change_current() {
        let registry = registry();
        registry.begin_install(&"v1".into()).await.unwrap();
        assert_eq!(registry.current().await, None);
        assert!(registry.storage().contains(&"v1".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_promote_requires_commit() {
        let registry = registry();
        registry.begin_install(&"v1".into()).await.unwrap();
        assert!(matches!(
            registry.promote(&"v1".into()).await,
            Err(SwError::NotInstalled(_))
        ));

        registry.commit_install(&"v1".into()).await.unwrap();
        assert_eq!(registry.promote(&"v1".into()).await.unwrap(), None);
        assert_eq!(registry.current().await, Some(GenerationId::from("v1")));
    }

    #[tokio::test]
    async fn test_promote_returns_previous() {
        let registry = registry();
        installed(&registry, "v1").await;
        registry.promote(&"v1".into()).await.unwrap();
        installed(&registry, "v2").await;

        assert_eq!(
            registry.promote(&"v2".into()).await.unwrap(),
            Some(GenerationId::from("v1"))
        );
        assert_eq!(registry.current_handle().await, Some(CacheHandle::new("v2".into())));
    }

    #[tokio::test]
    async fn test_reap_only_for_current() {
        let registry = registry();
        installed(&registry, "v1").await;
        assert!(matches!(
            registry.reap(&"v1".into()).await,
            Err(SwError::NotCurrent(_))
        ));
        // Nothing was deleted by the refused reap.
        assert!(registry.storage().contains(&"v1".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reap_deletes_superseded() {
        let registry = registry();
        let old = installed(&registry, "v1").await;
        registry.promote(&"v1".into()).await.unwrap();
        installed(&registry, "v2").await;
        registry.promote(&"v2".into()).await.unwrap();

        let deleted = registry.reap(&"v2".into()).await.unwrap();
        assert_eq!(deleted, vec![GenerationId::from("v1")]);

        let key = RequestKey::get(&Url::parse("https://app.test/").unwrap());
        assert!(matches!(
            registry.storage().get(&old, &key).await,
            Err(SwError::GenerationAbsent(_))
        ));
        assert_eq!(
            registry.storage().generations().await.unwrap(),
            vec![GenerationId::from("v2")]
        );
    }

    #[tokio::test]
    async fn test_reap_spares_install_in_flight() {
        let registry = registry();
        installed(&registry, "v1").await;
        registry.promote(&"v1".into()).await.unwrap();
        registry.begin_install(&"v2".into()).await.unwrap();

        assert!(registry.reap(&"v1".into()).await.unwrap().is_empty());
        assert!(registry.storage().contains(&"v2".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cannot_reinstall_or_discard_current() {
        let registry = registry();
        installed(&registry, "v1").await;
        registry.promote(&"v1".into()).await.unwrap();

        assert!(matches!(
            registry.begin_install(&"v1".into()).await,
            Err(SwError::GenerationInUse(_))
        ));
        assert!(matches!(
            registry.discard(&"v1".into()).await,
            Err(SwError::GenerationInUse(_))
        ));
        assert_eq!(registry.current().await, Some(GenerationId::from("v1")));
    }

    #[tokio::test]
    async fn test_begin_install_wipes_leftover() {
        let registry = registry();
        let handle = registry.begin_install(&"v2".into()).await.unwrap();
        let key = RequestKey::get(&Url::parse("https://app.test/stale.js").unwrap());
        let entry = CacheEntry {
            status: 200,
            headers: Vec::new(),
            body: Bytes::from_static(b"stale"),
            cached_at: 0,
        };
        registry.storage().put(&handle, key.clone(), entry).await.unwrap();

        let handle = registry.begin_install(&"v2".into()).await.unwrap();
        assert_eq!(registry.storage().get(&handle, &key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_discard_removes_generation() {
        let registry = registry();
        installed(&registry, "v1").await;
        assert!(registry.discard(&"v1".into()).await.unwrap());
        assert!(matches!(
            registry.promote(&"v1".into()).await,
            Err(SwError::NotInstalled(_))
        ));
    }

    #[tokio::test]
    async fn test_adopt_existing_generation() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage.open(&"v4".into()).await.unwrap();
        let registry = GenerationRegistry::new(storage);

        assert!(matches!(
            registry.adopt(&"v5".into()).await,
            Err(SwError::GenerationAbsent(_))
        ));
        registry.adopt(&"v4".into()).await.unwrap();
        assert_eq!(registry.current().await, Some(GenerationId::from("v4")));
    }
}
