//! Shared fixtures: a mocked scheduler and a running work queue.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};
use yhs_collector::client::RestClient;
use yhs_collector::workqueue::{WorkQueue, WorkQueueConfig};

pub fn queue_tree(partition: &str) -> Value {
    json!({
        "queuename": "root",
        "status": "Active",
        "partition": partition,
        "isLeaf": false,
        "isManaged": true,
        "children": [
            {"queuename": "root.default", "status": "Active", "partition": partition, "isLeaf": true},
            {
                "queuename": "root.batch",
                "status": "Active",
                "partition": partition,
                "isLeaf": false,
                "children": [
                    {"queuename": "root.batch.nightly", "status": "Active", "partition": partition, "isLeaf": true}
                ]
            }
        ]
    })
}

pub fn application(id: &str, partition: &str, queue: &str, state: &str) -> Value {
    json!({
        "applicationID": id,
        "partition": partition,
        "queueName": queue,
        "applicationState": state,
        "submissionTime": 1_700_000_000_000_000_000_i64,
        "user": "alice",
        "stateLog": []
    })
}

async fn mount_json(server: &MockServer, route: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Serve a scheduler with the given partitions, each with the same queue
/// tree and one node, and no applications unless mounted separately.
pub async fn mount_scheduler(server: &MockServer, partitions: &[&str]) {
    let listing: Vec<Value> = partitions
        .iter()
        .map(|name| json!({"clusterId": "cluster", "name": name, "state": "Active"}))
        .collect();
    mount_json(server, "/ws/v1/partitions", Value::Array(listing)).await;

    for name in partitions {
        mount_json(server, &format!("/ws/v1/partition/{name}/queues"), queue_tree(name)).await;
        mount_json(
            server,
            &format!("/ws/v1/partition/{name}/nodes"),
            json!([{"nodeID": format!("{name}-node-1"), "hostName": "host-1"}]),
        )
        .await;
    }

    mount_json(server, "/ws/v1/scheduler/node-utilizations", json!([])).await;
    mount_json(
        server,
        "/ws/v1/history/apps",
        json!([{"timestamp": 1000, "totalApplications": "2"}]),
    )
    .await;
    mount_json(
        server,
        "/ws/v1/history/containers",
        json!([{"timestamp": 1000, "totalContainers": "5"}]),
    )
    .await;
}

/// Serve `apps` from their queue's listing; every other queue is empty.
pub async fn mount_applications(server: &MockServer, apps: &[Value]) {
    for app in apps {
        let route = format!(
            "/ws/v1/partition/{}/queue/{}/applications",
            app["partition"].as_str().unwrap(),
            app["queueName"].as_str().unwrap()
        );
        let listing: Vec<Value> = apps
            .iter()
            .filter(|other| other["queueName"] == app["queueName"])
            .cloned()
            .collect();
        mount_json(server, &route, Value::Array(listing)).await;
    }

    Mock::given(method("GET"))
        .and(path_regex(r"^/ws/v1/partition/[^/]+/queue/[^/]+/applications$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .with_priority(10)
        .mount(server)
        .await;
}

pub fn client(server: &MockServer) -> Arc<RestClient> {
    Arc::new(RestClient::new(&server.uri()).unwrap())
}

/// A started work queue and the sender that stops it.
pub fn workqueue() -> (Arc<WorkQueue>, watch::Sender<bool>) {
    let queue = Arc::new(WorkQueue::new(WorkQueueConfig {
        initial_delay: Duration::from_millis(20),
        ..WorkQueueConfig::default()
    }));
    let (tx, rx) = watch::channel(false);
    queue.start(rx).unwrap();
    (queue, tx)
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

/// Wait until `queue` has drained everything handed to it so far.
pub async fn drained(queue: &WorkQueue) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    eventually(|| async move { queue.running_jobs() == 0 }).await;
}
