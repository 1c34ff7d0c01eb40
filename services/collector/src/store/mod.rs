//! Persistence layer for the collected history.
//!
//! This module provides:
//! - The [`PersistenceStore`] trait the sync engine writes through
//! - Record types with creation and soft-delete stamps
//! - [`MemoryStore`], an in-process implementation
//!
//! The Postgres implementation lives in [`crate::db`].
//!
//! Upserts coalesce: a field the incoming payload leaves unset keeps its
//! stored value. Application upserts additionally never move `state`
//! backwards; an incoming snapshot whose latest state-log entry is older
//! than the stored one keeps the stored state and state log.

mod memory;
mod records;

pub use memory::MemoryStore;
pub use records::{
    ApplicationRecord, HistoryKind, HistoryRecord, NodeRecord, NodeUtilizationRecord,
    PartitionRecord, QueueRecord, RecordFilters,
};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;
use yhs_events::{
    AppHistoryEntry, ApplicationInfo, ContainerHistoryEntry, NodeInfo, PartitionInfo,
    PartitionNodesUtil, QueueInfo,
};

use crate::db::DbError;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The entity to update does not exist (or is soft-deleted).
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Durable history of partitions, queues, nodes and applications.
///
/// `delete_*_not_in` soft-delete every live record created at or before
/// `as_of` whose key is not listed, stamping `deleted_at_nano = as_of`, and
/// return how many records were stamped.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn upsert_partitions(&self, partitions: &[PartitionInfo]) -> Result<(), StoreError>;

    async fn get_all_partitions(
        &self,
        filters: &RecordFilters,
    ) -> Result<Vec<PartitionRecord>, StoreError>;

    async fn delete_partitions_not_in(
        &self,
        names: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError>;

    /// Update a live queue and, recursively, its children. Children missing
    /// from the store are added under it.
    ///
    /// Fails with [`StoreError::NotFound`] if `queue` itself is not stored.
    async fn update_queue(&self, queue: &QueueInfo) -> Result<(), StoreError>;

    /// Insert queue trees under `parent_id`.
    async fn add_queues(&self, parent_id: Option<Uuid>, queues: &[QueueInfo])
        -> Result<(), StoreError>;

    async fn get_queues_in_partition(&self, partition: &str)
        -> Result<Vec<QueueRecord>, StoreError>;

    async fn delete_queues_not_in(
        &self,
        partition: &str,
        names: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError>;

    async fn upsert_nodes(&self, partition: &str, nodes: &[NodeInfo]) -> Result<(), StoreError>;

    async fn get_nodes_in_partition(&self, partition: &str) -> Result<Vec<NodeRecord>, StoreError>;

    async fn delete_nodes_not_in(
        &self,
        partition: &str,
        ids: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError>;

    async fn upsert_applications(&self, apps: &[ApplicationInfo]) -> Result<(), StoreError>;

    async fn get_all_applications(
        &self,
        filters: &RecordFilters,
    ) -> Result<Vec<ApplicationRecord>, StoreError>;

    /// The live record for `id`, or the most recently deleted one.
    async fn get_application(&self, id: &str) -> Result<Option<ApplicationRecord>, StoreError>;

    async fn delete_applications_not_in(
        &self,
        ids: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError>;

    async fn insert_node_utilizations(
        &self,
        utilizations: &[PartitionNodesUtil],
    ) -> Result<(), StoreError>;

    /// Record history points. Points already stored are skipped.
    async fn update_history(
        &self,
        apps: &[AppHistoryEntry],
        containers: &[ContainerHistoryEntry],
    ) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Whether an incoming application snapshot may replace the stored state.
pub(crate) fn state_advances(stored: &ApplicationInfo, incoming: &ApplicationInfo) -> bool {
    incoming.last_transition_nano().unwrap_or(0) >= stored.last_transition_nano().unwrap_or(0)
}

/// The stored form of a queue: no children, scoped to `partition`, with
/// `parent` set when known.
pub(crate) fn queue_row(queue: &QueueInfo, partition: &str, parent: Option<&str>) -> QueueInfo {
    QueueInfo {
        partition: partition.to_string(),
        parent: parent.map(str::to_string).or_else(|| queue.parent.clone()),
        children: Vec::new(),
        ..queue.clone()
    }
}
