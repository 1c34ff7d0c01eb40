//! Persisted history records.
//!
//! Each record wraps the scheduler payload it was built from together with
//! its lifecycle stamps. `created_at_nano` is set once on first insert and
//! `deleted_at_nano` once when the entity disappears from the scheduler. A
//! soft-deleted record is never revived; a reappearing entity gets a new row.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yhs_events::{ApplicationInfo, NodeInfo, PartitionInfo, PartitionNodesUtil, QueueInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub id: Uuid,
    pub created_at_nano: i64,
    pub deleted_at_nano: Option<i64>,
    pub partition: PartitionInfo,
}

/// A queue; `queue.children` is always empty, the tree is kept via `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub created_at_nano: i64,
    pub deleted_at_nano: Option<i64>,
    pub queue: QueueInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: Uuid,
    pub partition: String,
    pub created_at_nano: i64,
    pub deleted_at_nano: Option<i64>,
    pub node: NodeInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: Uuid,
    pub created_at_nano: i64,
    pub deleted_at_nano: Option<i64>,
    pub application: ApplicationInfo,
}

/// A node utilization snapshot. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUtilizationRecord {
    pub id: Uuid,
    pub created_at_nano: i64,
    pub utilization: PartitionNodesUtil,
}

/// Which total a history row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Application,
    Container,
}

impl HistoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Container => "container",
        }
    }
}

/// One point of the scheduler's application or container history.
/// Unique per `(kind, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub kind: HistoryKind,
    pub total_number: i64,
    pub timestamp: i64,
}

/// Filters for record listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilters {
    /// Partition name (for partitions, the partition itself).
    pub partition: Option<String>,
    pub queue: Option<String>,
    pub state: Option<String>,
    /// Include soft-deleted records.
    pub include_deleted: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RecordFilters {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            include_deleted: true,
            ..Self::default()
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub(crate) fn admits_deleted(&self, deleted_at_nano: Option<i64>) -> bool {
        self.include_deleted || deleted_at_nano.is_none()
    }

    /// Apply `offset` and `limit` to an already filtered listing.
    pub(crate) fn page<T>(&self, records: Vec<T>) -> Vec<T> {
        let limit = self.limit.unwrap_or(usize::MAX);
        records.into_iter().skip(self.offset).take(limit).collect()
    }
}
