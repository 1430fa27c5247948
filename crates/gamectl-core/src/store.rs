//! Instance store port.
//!
//! Durable persistence is an external collaborator; the core only needs
//! load/save semantics. [`MemoryInstanceStore`] backs tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::instance::Instance;

/// Port for loading and saving instance records.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Load an instance by ID.
    async fn load(&self, id: &str) -> Result<Instance, StoreError>;

    /// Persist the full instance record.
    async fn save(&self, instance: &Instance) -> Result<(), StoreError>;

    /// Load, mutate and persist an instance record in one step.
    ///
    /// The closure runs inside the store's write critical section, so two
    /// concurrent updates never overwrite each other's fields the way a
    /// separate load/save pair can. Returns the record after the mutation.
    async fn update(
        &self,
        id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Instance) + Send>,
    ) -> Result<Instance, StoreError>;

    /// Whether an instance exists.
    async fn exists(&self, id: &str) -> bool;

    /// Remove an instance record.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// All known instances.
    async fn list(&self) -> Vec<Instance>;
}

/// In-memory store: a reader/writer-locked map keyed by instance ID.
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<String, Instance>>,
}

impl MemoryInstanceStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Seed the store and return it ready for sharing.
    #[must_use]
    pub fn with_instances(instances: impl IntoIterator<Item = Instance>) -> Arc<Self> {
        let map = instances
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect::<HashMap<_, _>>();
        Arc::new(Self {
            instances: RwLock::new(map),
        })
    }
}

impl Default for MemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn load(&self, id: &str) -> Result<Instance, StoreError> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save(&self, instance: &Instance) -> Result<(), StoreError> {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn update(
        &self,
        id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Instance) + Send>,
    ) -> Result<Instance, StoreError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(instance);
        Ok(instance.clone())
    }

    async fn exists(&self, id: &str) -> bool {
        self.instances.read().await.contains_key(id)
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.instances
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceStatus, LaunchSpec};
    use std::path::PathBuf;

    fn sample(id: &str) -> Instance {
        Instance::new(
            id,
            id.to_uppercase(),
            LaunchSpec::Custom {
                command_line: "./srv".to_string(),
            },
            PathBuf::from("/tmp"),
        )
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let store = MemoryInstanceStore::new();
        store.save(&sample("a")).await.unwrap();

        let loaded = store.load("a").await.unwrap();
        assert_eq!(loaded.name, "A");
        assert!(store.exists("a").await);
        assert!(!store.exists("b").await);
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let store = MemoryInstanceStore::new();
        assert!(matches!(
            store.load("ghost").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = MemoryInstanceStore::new();
        assert!(matches!(
            store
                .update("ghost", Box::new(|i| i.restart_attempts = 1))
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_do_not_lose_writes() {
        let store = MemoryInstanceStore::with_instances([sample("a")]);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .update("a", Box::new(|i| i.restart_attempts += 1))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.load("a").await.unwrap().restart_attempts, 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_field_updates_keep_both_fields() {
        let store = MemoryInstanceStore::with_instances([sample("a")]);

        let counter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..50 {
                    store
                        .update("a", Box::new(|i| i.restart_attempts += 1))
                        .await
                        .unwrap();
                }
            })
        };
        let status = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..50 {
                    store
                        .update("a", Box::new(|i| i.status = InstanceStatus::Running))
                        .await
                        .unwrap();
                }
            })
        };
        counter.await.unwrap();
        status.await.unwrap();

        let record = store.load("a").await.unwrap();
        assert_eq!(record.restart_attempts, 50);
        assert_eq!(record.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn remove_deletes_record() {
        let store = MemoryInstanceStore::with_instances([sample("a"), sample("b")]);
        store.remove("a").await.unwrap();
        assert_eq!(store.list().await.len(), 1);
        assert!(matches!(
            store.remove("a").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
