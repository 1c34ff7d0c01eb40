//! Scheduler REST payload types.
//!
//! Field names follow the scheduler's JSON. Only fields the collector persists
//! are modelled; unknown fields are ignored. Scalars the scheduler may omit
//! are `Option` so that an upsert can tell "absent" from "zero".

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Resource quantities by resource name (`memory`, `vcore`, ...).
pub type Resource = BTreeMap<String, i64>;

// =============================================================================
// Partitions
// =============================================================================

/// Partition capacity summary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartitionCapacity {
    pub capacity: Option<Resource>,
    pub used_capacity: Option<Resource>,
    pub utilization: Option<Resource>,
}

/// A scheduler partition. Natural key: `name`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartitionInfo {
    pub cluster_id: Option<String>,
    pub name: String,
    pub capacity: PartitionCapacity,
    pub total_nodes: Option<i64>,
    /// Application counts by state.
    pub applications: Option<BTreeMap<String, i64>>,
    pub total_containers: Option<i64>,
    pub state: Option<String>,
    pub last_state_transition_time: Option<i64>,
}

// =============================================================================
// Queues
// =============================================================================

/// A queue and, recursively, its children. Natural key: `(partition, queue_name)`.
///
/// Children returned by the scheduler do not carry their own `partition`;
/// call [`QueueInfo::stamp_partition`] before persisting a tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueInfo {
    #[serde(rename = "queuename")]
    pub queue_name: String,
    pub status: Option<String>,
    pub partition: String,
    pub parent: Option<String>,
    pub pending_resource: Option<Resource>,
    pub max_resource: Option<Resource>,
    pub guaranteed_resource: Option<Resource>,
    pub allocated_resource: Option<Resource>,
    pub preempting_resource: Option<Resource>,
    pub is_leaf: Option<bool>,
    pub is_managed: Option<bool>,
    pub properties: Option<BTreeMap<String, String>>,
    pub max_running_apps: Option<i64>,
    pub running_apps: Option<i64>,
    pub current_priority: Option<i64>,
    pub abs_used_capacity: Option<Resource>,
    pub children: Vec<QueueInfo>,
}

impl QueueInfo {
    /// Set `partition` on this queue and every descendant.
    pub fn stamp_partition(&mut self, partition: &str) {
        self.partition = partition.to_string();
        for child in &mut self.children {
            child.stamp_partition(partition);
        }
    }

    /// Number of queues in this tree, including the root.
    pub fn tree_size(&self) -> usize {
        1 + self.children.iter().map(QueueInfo::tree_size).sum::<usize>()
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// A scheduler node. Natural key: `node_id`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    pub host_name: Option<String>,
    pub rack_name: Option<String>,
    pub attributes: Option<BTreeMap<String, String>>,
    pub capacity: Option<Resource>,
    pub allocated: Option<Resource>,
    pub occupied: Option<Resource>,
    pub available: Option<Resource>,
    pub utilized: Option<Resource>,
    pub allocations: Vec<AllocationInfo>,
    pub schedulable: Option<bool>,
    pub is_reserved: Option<bool>,
    pub reservations: Vec<String>,
}

/// Node utilization buckets for one partition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartitionNodesUtil {
    pub cluster_id: Option<String>,
    pub partition: String,
    #[serde(rename = "utilizations")]
    pub nodes_util_list: Vec<NodesUtil>,
}

/// Utilization histogram for one resource type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodesUtil {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub utilization: Vec<UtilizationBucket>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UtilizationBucket {
    pub bucket_name: String,
    pub num_of_nodes: i64,
    pub node_names: Vec<String>,
}

// =============================================================================
// Applications
// =============================================================================

/// One entry of an application's state log.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateLogEntry {
    pub time: i64,
    pub application_state: String,
}

/// An allocation held by an application. Keyed by `allocation_key`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocationInfo {
    pub allocation_key: String,
    pub allocation_time: i64,
    pub resource: Resource,
    pub priority: Option<String>,
    pub node_id: Option<String>,
    pub application_id: Option<String>,
    pub placeholder: bool,
    pub task_group_name: Option<String>,
}

/// A pending allocation request. Keyed by `allocation_key`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestInfo {
    pub allocation_key: String,
    pub request_time: i64,
    pub resource: Resource,
    pub pending_count: Option<i64>,
    pub priority: Option<String>,
    pub application_id: Option<String>,
    pub placeholder: bool,
    pub task_group_name: Option<String>,
}

/// A scheduler application. Natural key: `id`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationInfo {
    #[serde(rename = "applicationID")]
    pub id: String,
    pub partition: String,
    pub queue_name: String,
    pub used_resource: Option<Resource>,
    pub max_used_resource: Option<Resource>,
    pub pending_resource: Option<Resource>,
    pub submission_time: Option<i64>,
    pub finished_time: Option<i64>,
    pub start_time: Option<i64>,
    #[serde(rename = "applicationState")]
    pub state: String,
    pub user: Option<String>,
    pub groups: Vec<String>,
    pub rejected_message: Option<String>,
    pub state_log: Vec<StateLogEntry>,
    pub has_reserved: Option<bool>,
    pub reservations: Vec<String>,
    pub max_request_priority: Option<i64>,
    pub allocations: Vec<AllocationInfo>,
    pub requests: Vec<RequestInfo>,
}

impl ApplicationInfo {
    /// Append an allocation unless one with the same key is already present.
    ///
    /// Returns `true` if the allocation was appended.
    pub fn append_allocation(&mut self, allocation: AllocationInfo) -> bool {
        if self
            .allocations
            .iter()
            .any(|a| a.allocation_key == allocation.allocation_key)
        {
            return false;
        }
        self.allocations.push(allocation);
        true
    }

    /// Append a request unless one with the same key is already present.
    ///
    /// Returns `true` if the request was appended.
    pub fn append_request(&mut self, request: RequestInfo) -> bool {
        if self
            .requests
            .iter()
            .any(|r| r.allocation_key == request.allocation_key)
        {
            return false;
        }
        self.requests.push(request);
        true
    }

    /// Record a lifecycle transition: append to the state log and set `state`.
    pub fn record_state(&mut self, time: i64, state: &str) {
        self.state_log.push(StateLogEntry {
            time,
            application_state: state.to_string(),
        });
        self.state = state.to_string();
    }

    /// Time of the most recent state transition, if any.
    pub fn last_transition_nano(&self) -> Option<i64> {
        self.state_log.iter().map(|entry| entry.time).max()
    }
}

// =============================================================================
// History
// =============================================================================

/// Total application count at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppHistoryEntry {
    pub timestamp: i64,
    #[serde(deserialize_with = "string_or_number")]
    pub total_applications: i64,
}

/// Total container count at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerHistoryEntry {
    pub timestamp: i64,
    #[serde(deserialize_with = "string_or_number")]
    pub total_containers: i64,
}

/// The scheduler reports history totals as strings.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Total {
        Number(i64),
        Text(String),
    }

    match Total::deserialize(deserializer)? {
        Total::Number(n) => Ok(n),
        Total::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// =============================================================================
// Health
// =============================================================================

/// Scheduler self-reported health.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerHealth {
    #[serde(rename = "Healthy")]
    pub healthy: bool,
    #[serde(rename = "HealthChecks")]
    pub health_checks: Vec<HealthCheckInfo>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Succeeded")]
    pub succeeded: bool,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "DiagnosisMessage")]
    pub diagnosis_message: String,
}
