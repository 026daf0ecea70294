// Execution Store - the only shared mutable resource of the engine
//
// Everything above this layer is built on one primitive: a conditional
// find-and-modify that returns the new document only when the filter
// still matches at write time.

pub mod memory;
pub mod query;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::execution::types::NodeExecution;

pub use memory::InMemoryExecutionStore;
pub use query::{NodeQuery, NodeUpdate, Sort, TimeoutFilter};
#[cfg(feature = "database")]
pub use sqlite::SqliteExecutionStore;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Duplicate node execution id: {id}")]
    DuplicateKey { id: String },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a multi-record update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAck {
    pub acknowledged: bool,
    pub matched: u64,
    pub modified: u64,
}

impl UpdateAck {
    pub fn acknowledged(matched: u64, modified: u64) -> Self {
        Self {
            acknowledged: true,
            matched,
            modified,
        }
    }

    pub fn unacknowledged() -> Self {
        Self {
            acknowledged: false,
            matched: 0,
            modified: 0,
        }
    }
}

/// Persistent collection of node executions keyed by id
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a fresh record; assigns version 0
    async fn insert(&self, record: NodeExecution) -> StoreResult<NodeExecution>;

    /// Insert several fresh records; all or nothing on duplicate ids
    async fn insert_many(&self, records: Vec<NodeExecution>) -> StoreResult<Vec<NodeExecution>>;

    /// Replace a whole record if its stored version equals `record.version`
    async fn replace(&self, record: NodeExecution) -> StoreResult<Option<NodeExecution>>;

    async fn get(&self, id: &str) -> StoreResult<Option<NodeExecution>>;

    async fn find(&self, query: &NodeQuery) -> StoreResult<Vec<NodeExecution>>;

    async fn count(&self, query: &NodeQuery) -> StoreResult<u64>;

    /// Atomically: find the first record matching `filter`, apply `update`,
    /// return the new document. `None` when nothing matched.
    async fn find_and_modify(
        &self,
        filter: &NodeQuery,
        update: &NodeUpdate,
    ) -> StoreResult<Option<NodeExecution>>;

    async fn update_many(&self, filter: &NodeQuery, update: &NodeUpdate) -> StoreResult<UpdateAck>;
}

/// Open the store selected by configuration
pub async fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn ExecutionStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory execution store");
            Ok(Arc::new(InMemoryExecutionStore::new()))
        }
        #[cfg(feature = "database")]
        StoreBackend::Sqlite => {
            let store =
                SqliteExecutionStore::connect(&config.url, config.max_connections, config.auto_migrate)
                    .await?;
            info!(url = %config.url, "Using SQLite execution store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "database"))]
        StoreBackend::Sqlite => Err(StoreError::BackendUnavailable(
            "sqlite backend requires the `database` feature".to_string(),
        )),
    }
}
