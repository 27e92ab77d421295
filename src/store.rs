use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::access::Viewer;
use crate::catalog::Dataset;
use crate::error::{EngineError, Result};

/// Persistence for dataset rows and manager assignments.
///
/// `save` writes the descriptive attributes, timestamps and the whole metadata
/// document of one dataset in a single atomic step.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Fails with `Conflict` when the name is taken.
    async fn insert(&self, dataset: &Dataset) -> Result<()>;

    async fn save(&self, dataset: &Dataset) -> Result<()>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Dataset>>;

    /// Datasets the viewer may see, in no particular order.
    async fn list_visible(&self, viewer: &Viewer) -> Result<Vec<Dataset>>;

    /// Removes the row and its manager assignments.
    async fn delete(&self, dataset_id: &str) -> Result<bool>;

    async fn add_manager(&self, dataset_id: &str, account_id: Uuid) -> Result<()>;

    async fn remove_manager(&self, dataset_id: &str, account_id: Uuid) -> Result<bool>;

    async fn managers(&self, dataset_id: &str) -> Result<Vec<Uuid>>;

    /// Drops every dataset and assignment. Used for teardown.
    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    datasets: BTreeMap<String, Dataset>,
    managers: BTreeSet<(String, Uuid)>,
}

impl MemoryState {
    fn managers_of(&self, dataset_id: &str) -> Vec<Uuid> {
        self.managers
            .iter()
            .filter(|(id, _)| id == dataset_id)
            .map(|(_, account)| *account)
            .collect()
    }
}

/// Process-local store, used for embedding and tests.
#[derive(Default)]
pub struct MemoryDatasetStore {
    state: RwLock<MemoryState>,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DatasetStore for MemoryDatasetStore {
    async fn insert(&self, dataset: &Dataset) -> Result<()> {
        let mut state = self.state.write().await;
        if state.datasets.values().any(|d| d.name == dataset.name) {
            return Err(EngineError::Conflict {
                name: dataset.name.clone(),
            });
        }
        state
            .datasets
            .insert(dataset.id.clone(), dataset.detached());
        info!("Added dataset {} to memory store", dataset.name);
        Ok(())
    }

    async fn save(&self, dataset: &Dataset) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .datasets
            .get_mut(&dataset.id)
            .ok_or_else(|| EngineError::DatasetNotFound {
                name: dataset.name.clone(),
            })?;
        let name = stored.name.clone();
        *stored = dataset.detached();
        stored.name = name;
        Ok(())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Dataset>> {
        let state = self.state.read().await;
        Ok(state
            .datasets
            .values()
            .find(|d| d.name == name)
            .map(Dataset::detached))
    }

    async fn list_visible(&self, viewer: &Viewer) -> Result<Vec<Dataset>> {
        let state = self.state.read().await;
        Ok(state
            .datasets
            .values()
            .filter(|d| {
                viewer
                    .visibility(d.private, &state.managers_of(&d.id))
                    .allows_read()
            })
            .map(Dataset::detached)
            .collect())
    }

    async fn delete(&self, dataset_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        state.managers.retain(|(id, _)| id != dataset_id);
        Ok(state.datasets.remove(dataset_id).is_some())
    }

    async fn add_manager(&self, dataset_id: &str, account_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.datasets.contains_key(dataset_id) {
            return Err(EngineError::DatasetNotFound {
                name: dataset_id.to_string(),
            });
        }
        state.managers.insert((dataset_id.to_string(), account_id));
        Ok(())
    }

    async fn remove_manager(&self, dataset_id: &str, account_id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state
            .managers
            .remove(&(dataset_id.to_string(), account_id)))
    }

    async fn managers(&self, dataset_id: &str) -> Result<Vec<Uuid>> {
        Ok(self.state.read().await.managers_of(dataset_id))
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.datasets.clear();
        state.managers.clear();
        Ok(())
    }
}
