//! Change events published on the scheduler's event feed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::EventError;

/// An enum value as it may appear on the wire: an integer code or its name.
#[doc(hidden)]
#[derive(Deserialize)]
#[serde(untagged)]
pub enum WireCode {
    Code(i32),
    Name(String),
}

wire_enum! {
    /// The kind of object an event describes.
    EventType {
        Unknown = 0 => "UNKNOWN_EVENTRECORD_TYPE",
        Request = 1 => "REQUEST",
        App = 2 => "APP",
        Node = 3 => "NODE",
        Queue = 4 => "QUEUE",
        UserGroup = 5 => "USERGROUP",
    }
}

wire_enum! {
    /// What happened to the object.
    ChangeType {
        None = 0 => "NONE",
        Set = 1 => "SET",
        Add = 2 => "ADD",
        Remove = 3 => "REMOVE",
    }
}

wire_enum! {
    /// Additional detail about the change; meaning depends on [`EventType`].
    ChangeDetail {
        DetailsNone = 0 => "DETAILS_NONE",

        RequestCancel = 100 => "REQUEST_CANCEL",
        RequestAlloc = 101 => "REQUEST_ALLOC",
        RequestTimeout = 102 => "REQUEST_TIMEOUT",

        AppAlloc = 200 => "APP_ALLOC",
        AppRequest = 201 => "APP_REQUEST",
        AppReject = 202 => "APP_REJECT",
        AppNew = 203 => "APP_NEW",
        AppAccepted = 204 => "APP_ACCEPTED",
        AppStarting = 205 => "APP_STARTING",
        AppRunning = 206 => "APP_RUNNING",
        AppCompleting = 207 => "APP_COMPLETING",
        AppCompleted = 208 => "APP_COMPLETED",
        AppFailing = 209 => "APP_FAILING",
        AppFailed = 210 => "APP_FAILED",
        AppResuming = 211 => "APP_RESUMING",
        AppExpired = 212 => "APP_EXPIRED",
        AppCannotRunQueue = 213 => "APP_CANNOTRUN_QUEUE",
        AppCannotRunQuota = 214 => "APP_CANNOTRUN_QUOTA",
        AppRunnable = 215 => "APP_RUNNABLE",

        NodeDecommission = 300 => "NODE_DECOMISSION",
        NodeReady = 301 => "NODE_READY",
        NodeSchedulable = 302 => "NODE_SCHEDULABLE",
        NodeAlloc = 303 => "NODE_ALLOC",
        NodeCapacity = 304 => "NODE_CAPACITY",
        NodeOccupied = 305 => "NODE_OCCUPIED",
        NodeReservation = 306 => "NODE_RESERVATION",

        QueueConfig = 400 => "QUEUE_CONFIG",
        QueueDynamic = 401 => "QUEUE_DYNAMIC",
        QueueType = 402 => "QUEUE_TYPE",
        QueueMax = 403 => "QUEUE_MAX",
        QueueGuaranteed = 404 => "QUEUE_GUARANTEED",
        QueueApp = 405 => "QUEUE_APP",
        QueueAlloc = 406 => "QUEUE_ALLOC",

        AllocCancel = 500 => "ALLOC_CANCEL",
        AllocPreempt = 501 => "ALLOC_PREEMPT",
        AllocTimeout = 502 => "ALLOC_TIMEOUT",
        AllocReplaced = 503 => "ALLOC_REPLACED",
        AllocNodeRemoved = 504 => "ALLOC_NODEREMOVED",

        UserGroupUserLimit = 600 => "UG_USER_LIMIT",
        UserGroupGroupLimit = 601 => "UG_GROUP_LIMIT",
        UserGroupAppLink = 602 => "UG_APP_LINK",
        UserGroupUserResource = 603 => "UG_USER_RESOURCE",
        UserGroupGroupResource = 604 => "UG_GROUP_RESOURCE",
    }
}

impl ChangeDetail {
    /// Whether this detail is an application lifecycle transition reported via `SET`.
    pub fn is_app_transition(self) -> bool {
        matches!(
            self,
            Self::AppAccepted
                | Self::AppStarting
                | Self::AppRunning
                | Self::AppCompleting
                | Self::AppCompleted
                | Self::AppFailing
                | Self::AppFailed
                | Self::AppResuming
                | Self::AppExpired
        )
    }

    /// Whether an application in this state is done and will not change again.
    pub fn is_app_terminal(self) -> bool {
        matches!(self, Self::AppCompleted | Self::AppFailed | Self::AppReject)
    }

    /// Allocation and request removals an application event may carry.
    pub fn is_alloc_or_request_removal(self) -> bool {
        matches!(
            self,
            Self::AllocCancel
                | Self::AllocTimeout
                | Self::AllocReplaced
                | Self::AllocPreempt
                | Self::AllocNodeRemoved
                | Self::AppRequest
                | Self::RequestTimeout
                | Self::RequestCancel
        )
    }
}

/// One change notification from the scheduler's event feed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeEvent {
    /// Kind of object the event describes.
    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(rename = "eventChangeType")]
    pub change_type: ChangeType,

    #[serde(rename = "eventChangeDetail")]
    pub change_detail: ChangeDetail,

    /// External key of the object (application ID, node ID, queue path).
    #[serde(rename = "objectID")]
    pub object_id: String,

    /// Secondary key; an allocation or request key for application events.
    #[serde(rename = "referenceID")]
    pub reference_id: String,

    pub message: String,

    pub timestamp_nano: i64,

    /// Resource delta carried by the event, by resource name.
    #[serde(with = "resource_wire")]
    pub resource: BTreeMap<String, i64>,

    /// Optional serialized object state attached by some scheduler versions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl ChangeEvent {
    /// Decode one line of the event feed.
    pub fn decode(line: &[u8]) -> Result<Self, EventError> {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return Err(EventError::Empty);
        }
        Ok(serde_json::from_slice(trimmed)?)
    }

    /// Counter key for this event: `(type, change type)`.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.event_type, self.change_type)
    }
}

/// Grouping key used for event statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub event_type: EventType,
    pub change_type: ChangeType,
}

impl EventKey {
    pub const fn new(event_type: EventType, change_type: ChangeType) -> Self {
        Self {
            event_type,
            change_type,
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.event_type, self.change_type)
    }
}

/// The scheduler nests quantities as `{"resources": {"memory": {"value": 1}}}`;
/// older feeds and test fixtures use a flat `{"memory": 1}` map. Both decode.
mod resource_wire {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Quantity {
        #[serde(default)]
        value: i64,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Nested { resources: BTreeMap<String, Quantity> },
        Flat(BTreeMap<String, i64>),
    }

    #[derive(Serialize)]
    struct Nested<'a> {
        resources: BTreeMap<&'a str, Quantity>,
    }

    pub fn serialize<S: Serializer>(
        resource: &BTreeMap<String, i64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        Nested {
            resources: resource
                .iter()
                .map(|(name, value)| (name.as_str(), Quantity { value: *value }))
                .collect(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, i64>, D::Error> {
        Ok(match Option::<Wire>::deserialize(deserializer)? {
            None => BTreeMap::new(),
            Some(Wire::Flat(flat)) => flat,
            Some(Wire::Nested { resources }) => resources
                .into_iter()
                .map(|(name, quantity)| (name, quantity.value))
                .collect(),
        })
    }
}
