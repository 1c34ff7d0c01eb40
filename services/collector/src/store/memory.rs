//! In-process [`PersistenceStore`].
//!
//! Holds everything behind one mutex. Used by tests and by collector runs
//! configured with `YHS_STORE=memory`; nothing survives a restart.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;
use yhs_events::{
    AppHistoryEntry, ApplicationInfo, ContainerHistoryEntry, NodeInfo, PartitionInfo,
    PartitionNodesUtil, QueueInfo,
};
use yhs_reconcile::unix_nanos;

use super::{
    queue_row, state_advances, ApplicationRecord, HistoryKind, HistoryRecord, NodeRecord,
    NodeUtilizationRecord, PartitionRecord, PersistenceStore, QueueRecord, RecordFilters,
    StoreError,
};

#[derive(Debug, Default)]
struct Inner {
    partitions: Vec<PartitionRecord>,
    queues: Vec<QueueRecord>,
    nodes: Vec<NodeRecord>,
    applications: Vec<ApplicationRecord>,
    utilizations: Vec<NodeUtilizationRecord>,
    history: BTreeMap<(HistoryKind, i64), HistoryRecord>,
}

/// [`PersistenceStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every stored history point, ordered by kind then timestamp.
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.inner().history.values().cloned().collect()
    }

    /// Every node row, soft-deleted ones included, in insertion order.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.inner().nodes.clone()
    }

    /// Every stored node utilization snapshot, oldest first.
    pub fn node_utilizations(&self) -> Vec<NodeUtilizationRecord> {
        self.inner().utilizations.clone()
    }
}

/// Overlay the fields `incoming` sets onto `stored`.
fn coalesce<T: Serialize + DeserializeOwned>(stored: &T, incoming: &T) -> Result<T, StoreError> {
    let mut merged = serde_json::to_value(stored)?;
    if let (Value::Object(base), Value::Object(overlay)) =
        (&mut merged, serde_json::to_value(incoming)?)
    {
        for (key, value) in overlay {
            if !value.is_null() {
                base.insert(key, value);
            }
        }
    }
    Ok(serde_json::from_value(merged)?)
}

/// Stamp every live record created at or before `as_of` whose key is unlisted.
fn soft_delete<'a, R: 'a>(
    records: impl Iterator<Item = &'a mut R>,
    keep: &HashSet<&str>,
    as_of: i64,
    stamps: impl Fn(&mut R) -> (&str, i64, &mut Option<i64>),
) -> u64 {
    let mut deleted = 0;
    for record in records {
        let (key, created_at, deleted_at) = stamps(record);
        if deleted_at.is_none() && created_at <= as_of && !keep.contains(key) {
            *deleted_at = Some(as_of);
            deleted += 1;
        }
    }
    deleted
}

impl Inner {
    fn live_queue(&self, partition: &str, name: &str) -> Option<usize> {
        self.queues.iter().position(|r| {
            r.deleted_at_nano.is_none()
                && r.queue.partition == partition
                && r.queue.queue_name == name
        })
    }

    fn update_queue(&mut self, queue: &QueueInfo, partition: &str) -> Result<(), StoreError> {
        let index = self
            .live_queue(partition, &queue.queue_name)
            .ok_or_else(|| StoreError::not_found("queue", &queue.queue_name))?;

        let record = &mut self.queues[index];
        let incoming = queue_row(queue, partition, None);
        record.queue = coalesce(&record.queue, &incoming)?;
        let parent_id = record.id;

        for child in &queue.children {
            if self.live_queue(partition, &child.queue_name).is_some() {
                self.update_queue(child, partition)?;
            } else {
                self.add_queue(Some(parent_id), child, partition, Some(&queue.queue_name));
            }
        }
        Ok(())
    }

    fn add_queue(
        &mut self,
        parent_id: Option<Uuid>,
        queue: &QueueInfo,
        partition: &str,
        parent: Option<&str>,
    ) {
        let id = Uuid::new_v4();
        self.queues.push(QueueRecord {
            id,
            parent_id,
            created_at_nano: unix_nanos(),
            deleted_at_nano: None,
            queue: queue_row(queue, partition, parent),
        });
        for child in &queue.children {
            self.add_queue(Some(id), child, partition, Some(&queue.queue_name));
        }
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn upsert_partitions(&self, partitions: &[PartitionInfo]) -> Result<(), StoreError> {
        let mut inner = self.inner();
        for partition in partitions {
            let live = inner
                .partitions
                .iter_mut()
                .find(|r| r.deleted_at_nano.is_none() && r.partition.name == partition.name);
            match live {
                Some(record) => record.partition = coalesce(&record.partition, partition)?,
                None => inner.partitions.push(PartitionRecord {
                    id: Uuid::new_v4(),
                    created_at_nano: unix_nanos(),
                    deleted_at_nano: None,
                    partition: partition.clone(),
                }),
            }
        }
        Ok(())
    }

    async fn get_all_partitions(
        &self,
        filters: &RecordFilters,
    ) -> Result<Vec<PartitionRecord>, StoreError> {
        let records = self
            .inner()
            .partitions
            .iter()
            .filter(|r| filters.admits_deleted(r.deleted_at_nano))
            .filter(|r| filters.partition.as_ref().is_none_or(|p| *p == r.partition.name))
            .filter(|r| filters.state.is_none() || filters.state == r.partition.state)
            .cloned()
            .collect();
        Ok(filters.page(records))
    }

    async fn delete_partitions_not_in(
        &self,
        names: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError> {
        let keep: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut inner = self.inner();
        Ok(soft_delete(inner.partitions.iter_mut(), &keep, as_of, |r| {
            (&r.partition.name, r.created_at_nano, &mut r.deleted_at_nano)
        }))
    }

    async fn update_queue(&self, queue: &QueueInfo) -> Result<(), StoreError> {
        self.inner().update_queue(queue, &queue.partition)
    }

    async fn add_queues(
        &self,
        parent_id: Option<Uuid>,
        queues: &[QueueInfo],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner();
        for queue in queues {
            inner.add_queue(parent_id, queue, &queue.partition, None);
        }
        Ok(())
    }

    async fn get_queues_in_partition(
        &self,
        partition: &str,
    ) -> Result<Vec<QueueRecord>, StoreError> {
        let mut queues: Vec<_> = self
            .inner()
            .queues
            .iter()
            .filter(|r| r.deleted_at_nano.is_none() && r.queue.partition == partition)
            .cloned()
            .collect();
        queues.sort_by(|a, b| a.queue.queue_name.cmp(&b.queue.queue_name));
        Ok(queues)
    }

    async fn delete_queues_not_in(
        &self,
        partition: &str,
        names: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError> {
        let keep: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut inner = self.inner();
        let in_partition = inner
            .queues
            .iter_mut()
            .filter(|r| r.queue.partition == partition);
        Ok(soft_delete(in_partition, &keep, as_of, |r| {
            (&r.queue.queue_name, r.created_at_nano, &mut r.deleted_at_nano)
        }))
    }

    async fn upsert_nodes(&self, partition: &str, nodes: &[NodeInfo]) -> Result<(), StoreError> {
        let mut inner = self.inner();
        for node in nodes {
            let live = inner.nodes.iter_mut().find(|r| {
                r.deleted_at_nano.is_none() && r.partition == partition && r.node.node_id == node.node_id
            });
            match live {
                Some(record) => record.node = coalesce(&record.node, node)?,
                None => inner.nodes.push(NodeRecord {
                    id: Uuid::new_v4(),
                    partition: partition.to_string(),
                    created_at_nano: unix_nanos(),
                    deleted_at_nano: None,
                    node: node.clone(),
                }),
            }
        }
        Ok(())
    }

    async fn get_nodes_in_partition(&self, partition: &str) -> Result<Vec<NodeRecord>, StoreError> {
        Ok(self
            .inner()
            .nodes
            .iter()
            .filter(|r| r.deleted_at_nano.is_none() && r.partition == partition)
            .cloned()
            .collect())
    }

    async fn delete_nodes_not_in(
        &self,
        partition: &str,
        ids: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError> {
        let keep: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut inner = self.inner();
        let in_partition = inner.nodes.iter_mut().filter(|r| r.partition == partition);
        Ok(soft_delete(in_partition, &keep, as_of, |r| {
            (&r.node.node_id, r.created_at_nano, &mut r.deleted_at_nano)
        }))
    }

    async fn upsert_applications(&self, apps: &[ApplicationInfo]) -> Result<(), StoreError> {
        let mut inner = self.inner();
        for app in apps {
            let live = inner
                .applications
                .iter_mut()
                .find(|r| r.deleted_at_nano.is_none() && r.application.id == app.id);
            match live {
                Some(record) => {
                    let mut merged = coalesce(&record.application, app)?;
                    if !state_advances(&record.application, app) {
                        merged.state = record.application.state.clone();
                        merged.state_log = record.application.state_log.clone();
                    }
                    record.application = merged;
                }
                None => inner.applications.push(ApplicationRecord {
                    id: Uuid::new_v4(),
                    created_at_nano: unix_nanos(),
                    deleted_at_nano: None,
                    application: app.clone(),
                }),
            }
        }
        Ok(())
    }

    async fn get_all_applications(
        &self,
        filters: &RecordFilters,
    ) -> Result<Vec<ApplicationRecord>, StoreError> {
        let records = self
            .inner()
            .applications
            .iter()
            .filter(|r| filters.admits_deleted(r.deleted_at_nano))
            .filter(|r| {
                filters
                    .partition
                    .as_ref()
                    .is_none_or(|p| *p == r.application.partition)
            })
            .filter(|r| {
                filters
                    .queue
                    .as_ref()
                    .is_none_or(|q| *q == r.application.queue_name)
            })
            .filter(|r| filters.state.as_ref().is_none_or(|s| *s == r.application.state))
            .cloned()
            .collect();
        Ok(filters.page(records))
    }

    async fn get_application(&self, id: &str) -> Result<Option<ApplicationRecord>, StoreError> {
        let inner = self.inner();
        let mut matching: Vec<_> = inner
            .applications
            .iter()
            .filter(|r| r.application.id == id)
            .collect();
        // Live first, then the most recently deleted.
        matching.sort_by_key(|r| std::cmp::Reverse(r.deleted_at_nano.unwrap_or(i64::MAX)));
        Ok(matching.first().map(|r| (*r).clone()))
    }

    async fn delete_applications_not_in(
        &self,
        ids: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError> {
        let keep: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut inner = self.inner();
        Ok(soft_delete(inner.applications.iter_mut(), &keep, as_of, |r| {
            (&r.application.id, r.created_at_nano, &mut r.deleted_at_nano)
        }))
    }

    async fn insert_node_utilizations(
        &self,
        utilizations: &[PartitionNodesUtil],
    ) -> Result<(), StoreError> {
        let now = unix_nanos();
        self.inner()
            .utilizations
            .extend(utilizations.iter().map(|u| NodeUtilizationRecord {
                id: Uuid::new_v4(),
                created_at_nano: now,
                utilization: u.clone(),
            }));
        Ok(())
    }

    async fn update_history(
        &self,
        apps: &[AppHistoryEntry],
        containers: &[ContainerHistoryEntry],
    ) -> Result<(), StoreError> {
        let points = apps
            .iter()
            .map(|a| (HistoryKind::Application, a.timestamp, a.total_applications))
            .chain(
                containers
                    .iter()
                    .map(|c| (HistoryKind::Container, c.timestamp, c.total_containers)),
            );

        let mut inner = self.inner();
        for (kind, timestamp, total_number) in points {
            inner
                .history
                .entry((kind, timestamp))
                .or_insert_with(|| HistoryRecord {
                    id: Uuid::new_v4(),
                    kind,
                    total_number,
                    timestamp,
                });
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
