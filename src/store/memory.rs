//! In-memory store over concurrent maps.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::{ConfigStore, FunctionStore, StoreError};
use crate::model::{Function, ProjectConfig};

/// DashMap-backed store. The in-tree backend and the test double.
#[derive(Default)]
pub struct MemoryStore {
    functions: DashMap<Uuid, Function>,
    /// Keyed by "owner/project".
    configs: DashMap<String, ProjectConfig>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn config_key(owner: &str, project_id: &str) -> String {
        format!("{}/{}", owner, project_id)
    }
}

#[async_trait]
impl FunctionStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Function>, StoreError> {
        Ok(self.functions.get(&id).map(|r| r.clone()))
    }

    async fn list_by_project(
        &self,
        owner: &str,
        project_id: &str,
    ) -> Result<Vec<Function>, StoreError> {
        Ok(self
            .functions
            .iter()
            .filter(|r| r.owner == owner && r.project_id == project_id)
            .map(|r| r.clone())
            .collect())
    }

    async fn save(&self, function: &Function) -> Result<(), StoreError> {
        self.functions.insert(function.id, function.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.functions.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(
        &self,
        owner: &str,
        project_id: &str,
    ) -> Result<Option<ProjectConfig>, StoreError> {
        Ok(self
            .configs
            .get(&Self::config_key(owner, project_id))
            .map(|r| r.clone()))
    }

    async fn save(&self, config: &ProjectConfig) -> Result<(), StoreError> {
        self.configs.insert(
            Self::config_key(&config.owner, &config.project_id),
            config.clone(),
        );
        Ok(())
    }
}
