//! Persistence boundary for function and config records.
//!
//! The core only needs point lookups, a full-record upsert and delete; any
//! backend that can do that fits behind these traits. There is no caching in
//! front of a store; every read and write round-trips to it.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Function, ProjectConfig};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Function records, addressable by id and by (owner, project).
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Function>, StoreError>;

    async fn list_by_project(
        &self,
        owner: &str,
        project_id: &str,
    ) -> Result<Vec<Function>, StoreError>;

    /// Insert or fully replace the record with the same id.
    async fn save(&self, function: &Function) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Project config records, addressable by (owner, project).
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, owner: &str, project_id: &str)
        -> Result<Option<ProjectConfig>, StoreError>;

    async fn save(&self, config: &ProjectConfig) -> Result<(), StoreError>;
}
