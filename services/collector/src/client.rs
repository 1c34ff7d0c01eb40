//! Scheduler REST client.
//!
//! [`SchedulerClient`] is the seam the sync engine reads through;
//! [`RestClient`] implements it against the scheduler's `/ws/v1` API.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use yhs_events::{
    AppHistoryEntry, ApplicationInfo, ContainerHistoryEntry, NodeInfo, PartitionInfo,
    PartitionNodesUtil, QueueInfo, SchedulerHealth,
};

/// Partition used when a lookup does not name one.
pub const DEFAULT_PARTITION: &str = "default";

/// Errors talking to the scheduler.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport or decoding failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The scheduler answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Raw byte chunks of the event feed.
pub type EventByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

/// Read access to the scheduler.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn partitions(&self) -> Result<Vec<PartitionInfo>, ClientError>;

    /// The root of the partition's queue tree.
    async fn partition_queues(&self, partition: &str) -> Result<QueueInfo, ClientError>;

    /// Applications in a queue, or every active application in the partition
    /// when `queue` is `None`.
    async fn applications(
        &self,
        partition: &str,
        queue: Option<&str>,
    ) -> Result<Vec<ApplicationInfo>, ClientError>;

    /// A single application; `Ok(None)` when the scheduler does not know it.
    async fn application(
        &self,
        partition: Option<&str>,
        queue: Option<&str>,
        id: &str,
    ) -> Result<Option<ApplicationInfo>, ClientError>;

    async fn partition_nodes(&self, partition: &str) -> Result<Vec<NodeInfo>, ClientError>;

    async fn node_utilizations(&self) -> Result<Vec<PartitionNodesUtil>, ClientError>;

    async fn apps_history(&self) -> Result<Vec<AppHistoryEntry>, ClientError>;

    async fn containers_history(&self) -> Result<Vec<ContainerHistoryEntry>, ClientError>;

    /// Open the newline-delimited event feed.
    async fn event_stream(&self) -> Result<EventByteStream, ClientError>;

    async fn healthcheck(&self) -> Result<SchedulerHealth, ClientError>;
}

/// [`SchedulerClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    /// Request timeout for ordinary calls. The event feed has none.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, path: &str, timeout: Option<Duration>) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET");

        let mut request = self.http.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let resp = self.send(path, Some(Self::REQUEST_TIMEOUT)).await?;
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl SchedulerClient for RestClient {
    async fn partitions(&self) -> Result<Vec<PartitionInfo>, ClientError> {
        self.get_json("/ws/v1/partitions").await
    }

    async fn partition_queues(&self, partition: &str) -> Result<QueueInfo, ClientError> {
        self.get_json(&format!("/ws/v1/partition/{partition}/queues"))
            .await
    }

    async fn applications(
        &self,
        partition: &str,
        queue: Option<&str>,
    ) -> Result<Vec<ApplicationInfo>, ClientError> {
        let path = match queue {
            Some(queue) => format!("/ws/v1/partition/{partition}/queue/{queue}/applications"),
            None => format!("/ws/v1/partition/{partition}/applications/active"),
        };
        self.get_json(&path).await
    }

    async fn application(
        &self,
        partition: Option<&str>,
        queue: Option<&str>,
        id: &str,
    ) -> Result<Option<ApplicationInfo>, ClientError> {
        let partition = partition.unwrap_or(DEFAULT_PARTITION);
        let path = match queue {
            Some(queue) => format!("/ws/v1/partition/{partition}/queue/{queue}/application/{id}"),
            None => format!("/ws/v1/partition/{partition}/application/{id}"),
        };
        match self.get_json(&path).await {
            Ok(app) => Ok(Some(app)),
            Err(ClientError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn partition_nodes(&self, partition: &str) -> Result<Vec<NodeInfo>, ClientError> {
        self.get_json(&format!("/ws/v1/partition/{partition}/nodes"))
            .await
    }

    async fn node_utilizations(&self) -> Result<Vec<PartitionNodesUtil>, ClientError> {
        self.get_json("/ws/v1/scheduler/node-utilizations").await
    }

    async fn apps_history(&self) -> Result<Vec<AppHistoryEntry>, ClientError> {
        self.get_json("/ws/v1/history/apps").await
    }

    async fn containers_history(&self) -> Result<Vec<ContainerHistoryEntry>, ClientError> {
        self.get_json("/ws/v1/history/containers").await
    }

    async fn event_stream(&self) -> Result<EventByteStream, ClientError> {
        let resp = self.send("/ws/v1/events/stream", None).await?;
        Ok(resp.bytes_stream().map_err(ClientError::from).boxed())
    }

    async fn healthcheck(&self) -> Result<SchedulerHealth, ClientError> {
        self.get_json("/ws/v1/scheduler/healthcheck").await
    }
}

/// In-process [`SchedulerClient`] for unit tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeClient {
        pub partitions: Mutex<Vec<PartitionInfo>>,
        pub queues: Mutex<HashMap<String, QueueInfo>>,
        pub applications: Mutex<HashMap<String, ApplicationInfo>>,
        pub nodes: Mutex<HashMap<String, Vec<NodeInfo>>>,
        pub feed: Mutex<Vec<u8>>,
        pub healthy: bool,
        /// Fail every partition listing.
        pub offline: bool,
    }

    fn missing(what: &str) -> ClientError {
        ClientError::Status {
            status: 404,
            body: format!("{what} not found"),
        }
    }

    #[async_trait]
    impl SchedulerClient for FakeClient {
        async fn partitions(&self) -> Result<Vec<PartitionInfo>, ClientError> {
            if self.offline {
                return Err(ClientError::Status {
                    status: 503,
                    body: "scheduler unavailable".into(),
                });
            }
            Ok(self.partitions.lock().unwrap().clone())
        }

        async fn partition_queues(&self, partition: &str) -> Result<QueueInfo, ClientError> {
            self.queues
                .lock()
                .unwrap()
                .get(partition)
                .cloned()
                .ok_or_else(|| missing(partition))
        }

        async fn applications(
            &self,
            partition: &str,
            queue: Option<&str>,
        ) -> Result<Vec<ApplicationInfo>, ClientError> {
            Ok(self
                .applications
                .lock()
                .unwrap()
                .values()
                .filter(|a| a.partition == partition)
                .filter(|a| queue.is_none_or(|q| a.queue_name == q))
                .cloned()
                .collect())
        }

        async fn application(
            &self,
            _partition: Option<&str>,
            _queue: Option<&str>,
            id: &str,
        ) -> Result<Option<ApplicationInfo>, ClientError> {
            Ok(self.applications.lock().unwrap().get(id).cloned())
        }

        async fn partition_nodes(&self, partition: &str) -> Result<Vec<NodeInfo>, ClientError> {
            Ok(self
                .nodes
                .lock()
                .unwrap()
                .get(partition)
                .cloned()
                .unwrap_or_default())
        }

        async fn node_utilizations(&self) -> Result<Vec<PartitionNodesUtil>, ClientError> {
            Ok(Vec::new())
        }

        async fn apps_history(&self) -> Result<Vec<AppHistoryEntry>, ClientError> {
            Ok(Vec::new())
        }

        async fn containers_history(&self) -> Result<Vec<ContainerHistoryEntry>, ClientError> {
            Ok(Vec::new())
        }

        async fn event_stream(&self) -> Result<EventByteStream, ClientError> {
            let feed = Bytes::from(self.feed.lock().unwrap().clone());
            Ok(futures_util::stream::iter([Ok(feed)]).boxed())
        }

        async fn healthcheck(&self) -> Result<SchedulerHealth, ClientError> {
            Ok(SchedulerHealth {
                healthy: self.healthy,
                health_checks: Vec::new(),
            })
        }
    }
}
