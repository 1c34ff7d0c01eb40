//! Periodic full-state reconciliation.
//!
//! A cycle fetches everything the scheduler currently reports, queues jobs
//! that upsert it, and soft-deletes whatever stored record was not reported.
//! Every soft-delete uses the cycle start as its cut-off, so records created
//! by events that raced the cycle are left alone.

use std::future::Future;
use std::slice;
use std::sync::Arc;

use anyhow::Context;
use futures_util::future::join_all;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use yhs_events::{ApplicationInfo, PartitionInfo, QueueInfo};
use yhs_reconcile::{flatten, unix_nanos, MultiError, ReconcileError};

use super::SyncError;
use crate::client::SchedulerClient;
use crate::store::PersistenceStore;
use crate::workqueue::{Job, WorkQueue};

/// What a cycle fetched and queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub partitions: usize,
    pub queues: usize,
    pub applications: usize,
    pub nodes: usize,
    pub node_utilizations: usize,
    pub history_points: usize,
    /// Ids of the persistence jobs queued, in submission order per step.
    pub jobs: Vec<Uuid>,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.partitions += other.partitions;
        self.queues += other.queues;
        self.applications += other.applications;
        self.nodes += other.nodes;
        self.node_utilizations += other.node_utilizations;
        self.history_points += other.history_points;
        self.jobs.extend(other.jobs);
    }
}

/// Fetch-and-persist cycles against the scheduler's REST API.
pub struct Reconciler {
    client: Arc<dyn SchedulerClient>,
    store: Arc<dyn PersistenceStore>,
    workqueue: Arc<WorkQueue>,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn SchedulerClient>,
        store: Arc<dyn PersistenceStore>,
        workqueue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            client,
            store,
            workqueue,
        }
    }

    /// Reconcile partitions, queues, applications, nodes, node utilization
    /// and history.
    ///
    /// Scopes that fail do not stop the others; their errors are returned
    /// together once every scope has finished.
    #[instrument(skip(self), fields(component = "reconciler"))]
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let cycle_start = unix_nanos();
        let mut errors = MultiError::new();
        let (mut report, partitions) = self.sync_partitions(cycle_start, &mut errors).await?;

        let (queues, nodes, utilizations, history) = tokio::join!(
            self.sync_queues_and_applications(&partitions, cycle_start),
            self.sync_nodes(&partitions, cycle_start),
            self.sync_node_utilizations(),
            self.sync_history(),
        );
        for (step, step_errors) in [queues, nodes, utilizations, history] {
            report.absorb(step);
            errors.extend(step_errors);
        }

        finish(report, errors)
    }

    /// Reconcile partitions and their queue trees only.
    #[instrument(skip(self), fields(component = "reconciler"))]
    pub async fn sync_queues(&self) -> Result<SyncReport, SyncError> {
        let cycle_start = unix_nanos();
        let mut errors = MultiError::new();
        let (mut report, partitions) = self.sync_partitions(cycle_start, &mut errors).await?;

        let (step, _roots, step_errors) = self.sync_queue_trees(&partitions, cycle_start).await;
        report.absorb(step);
        errors.extend(step_errors);

        finish(report, errors)
    }

    async fn sync_partitions(
        &self,
        cycle_start: i64,
        errors: &mut MultiError,
    ) -> Result<(SyncReport, Vec<String>), SyncError> {
        let partitions = self
            .client
            .partitions()
            .await
            .map_err(SyncError::Partitions)?;
        let names: Vec<String> = partitions.iter().map(|p| p.name.clone()).collect();

        let mut report = SyncReport {
            partitions: partitions.len(),
            ..Default::default()
        };

        let partitions: Arc<[PartitionInfo]> = partitions.into();
        let keep: Arc<[String]> = names.clone().into();
        let job = self.enqueue("partitions", move |store| {
            let partitions = Arc::clone(&partitions);
            let keep = Arc::clone(&keep);
            async move {
                store
                    .upsert_partitions(&partitions)
                    .await
                    .context("failed to upsert partitions")?;
                let deleted = store
                    .delete_partitions_not_in(&keep, cycle_start)
                    .await
                    .context("failed to delete stale partitions")?;
                if deleted > 0 {
                    info!(deleted, "Soft-deleted partitions");
                }
                Ok::<_, anyhow::Error>(())
            }
        });
        match job {
            Ok(id) => report.jobs.push(id),
            Err(e) => errors.push(e),
        }

        Ok((report, names))
    }

    /// Fetch every partition's queue tree and queue a job storing each.
    async fn sync_queue_trees(
        &self,
        partitions: &[String],
        cycle_start: i64,
    ) -> (SyncReport, Vec<QueueInfo>, MultiError) {
        let fetched = join_all(partitions.iter().map(|partition| async move {
            (partition, self.client.partition_queues(partition).await)
        }))
        .await;

        let mut report = SyncReport::default();
        let mut roots = Vec::new();
        let mut errors = MultiError::new();

        for (partition, result) in fetched {
            let mut root = match result {
                Ok(root) => root,
                Err(e) => {
                    warn!(partition = %partition, error = %e, "Failed to fetch queues");
                    errors.push(ReconcileError::fetch(format!("queues/{partition}"), e));
                    continue;
                }
            };
            root.stamp_partition(partition);

            let names: Arc<[String]> = flatten(slice::from_ref(&root))
                .into_iter()
                .map(|q| q.queue_name)
                .collect();
            report.queues += names.len();

            let tree = Arc::new(root.clone());
            let partition_name = partition.clone();
            let job = self.enqueue(format!("queues/{partition}"), move |store| {
                let tree = Arc::clone(&tree);
                let names = Arc::clone(&names);
                let partition = partition_name.clone();
                async move {
                    match store.update_queue(&tree).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => store
                            .add_queues(None, slice::from_ref(&*tree))
                            .await
                            .with_context(|| format!("failed to add queues of {partition}"))?,
                        Err(e) => {
                            return Err(e)
                                .with_context(|| format!("failed to update queues of {partition}"))
                        }
                    }
                    store
                        .delete_queues_not_in(&partition, &names, cycle_start)
                        .await
                        .with_context(|| format!("failed to delete stale queues of {partition}"))?;
                    Ok::<_, anyhow::Error>(())
                }
            });
            match job {
                Ok(id) => report.jobs.push(id),
                Err(e) => errors.push(e),
            }
            roots.push(root);
        }

        (report, roots, errors)
    }

    async fn sync_queues_and_applications(
        &self,
        partitions: &[String],
        cycle_start: i64,
    ) -> (SyncReport, MultiError) {
        let (mut report, roots, mut errors) = self.sync_queue_trees(partitions, cycle_start).await;
        let trees_complete = errors.is_empty();

        let queues = flatten(&roots);
        let fetched = join_all(queues.iter().map(|queue| async move {
            let result = self
                .client
                .applications(&queue.partition, Some(queue.queue_name.as_str()))
                .await;
            (queue, result)
        }))
        .await;

        let mut apps: Vec<ApplicationInfo> = Vec::new();
        let mut fetches_complete = true;
        for (queue, result) in fetched {
            match result {
                Ok(found) => apps.extend(found),
                Err(e) => {
                    warn!(
                        partition = %queue.partition,
                        queue = %queue.queue_name,
                        error = %e,
                        "Failed to fetch applications"
                    );
                    fetches_complete = false;
                    errors.push(ReconcileError::fetch(
                        format!("applications/{}/{}", queue.partition, queue.queue_name),
                        e,
                    ));
                }
            }
        }
        report.applications = apps.len();

        // A partial listing would soft-delete applications that are still alive.
        let keep: Option<Arc<[String]>> = (trees_complete && fetches_complete)
            .then(|| apps.iter().map(|a| a.id.clone()).collect());
        let apps: Arc<[ApplicationInfo]> = apps.into();
        let job = self.enqueue("applications", move |store| {
            let apps = Arc::clone(&apps);
            let keep = keep.clone();
            async move {
                store
                    .upsert_applications(&apps)
                    .await
                    .context("failed to upsert applications")?;
                if let Some(keep) = keep {
                    let deleted = store
                        .delete_applications_not_in(&keep, cycle_start)
                        .await
                        .context("failed to delete stale applications")?;
                    if deleted > 0 {
                        info!(deleted, "Soft-deleted applications");
                    }
                }
                Ok::<_, anyhow::Error>(())
            }
        });
        match job {
            Ok(id) => report.jobs.push(id),
            Err(e) => errors.push(e),
        }

        (report, errors)
    }

    async fn sync_nodes(&self, partitions: &[String], cycle_start: i64) -> (SyncReport, MultiError) {
        let fetched = join_all(partitions.iter().map(|partition| async move {
            (partition, self.client.partition_nodes(partition).await)
        }))
        .await;

        let mut report = SyncReport::default();
        let mut errors = MultiError::new();
        for (partition, result) in fetched {
            let nodes = match result {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!(partition = %partition, error = %e, "Failed to fetch nodes");
                    errors.push(ReconcileError::fetch(format!("nodes/{partition}"), e));
                    continue;
                }
            };
            report.nodes += nodes.len();

            let ids: Arc<[String]> = nodes.iter().map(|n| n.node_id.clone()).collect();
            let nodes: Arc<[_]> = nodes.into();
            let partition_name = partition.clone();
            let job = self.enqueue(format!("nodes/{partition}"), move |store| {
                let nodes = Arc::clone(&nodes);
                let ids = Arc::clone(&ids);
                let partition = partition_name.clone();
                async move {
                    store
                        .upsert_nodes(&partition, &nodes)
                        .await
                        .with_context(|| format!("failed to upsert nodes of {partition}"))?;
                    store
                        .delete_nodes_not_in(&partition, &ids, cycle_start)
                        .await
                        .with_context(|| format!("failed to delete stale nodes of {partition}"))?;
                    Ok::<_, anyhow::Error>(())
                }
            });
            match job {
                Ok(id) => report.jobs.push(id),
                Err(e) => errors.push(e),
            }
        }

        (report, errors)
    }

    async fn sync_node_utilizations(&self) -> (SyncReport, MultiError) {
        let mut report = SyncReport::default();
        let utilizations = match self.client.node_utilizations().await {
            Ok(utilizations) => utilizations,
            Err(e) => {
                warn!(error = %e, "Failed to fetch node utilizations");
                return (report, ReconcileError::fetch("node-utilizations", e).into());
            }
        };
        report.node_utilizations = utilizations.len();

        let utilizations: Arc<[_]> = utilizations.into();
        match self.enqueue("node-utilizations", move |store| {
            let utilizations = Arc::clone(&utilizations);
            async move {
                store
                    .insert_node_utilizations(&utilizations)
                    .await
                    .context("failed to insert node utilizations")
            }
        }) {
            Ok(id) => {
                report.jobs.push(id);
                (report, MultiError::new())
            }
            Err(e) => (report, e.into()),
        }
    }

    async fn sync_history(&self) -> (SyncReport, MultiError) {
        let (apps, containers) =
            tokio::join!(self.client.apps_history(), self.client.containers_history());

        let mut report = SyncReport::default();
        let mut errors = MultiError::new();
        let apps = apps.unwrap_or_else(|e| {
            errors.push(ReconcileError::fetch("history/apps", e));
            Vec::new()
        });
        let containers = containers.unwrap_or_else(|e| {
            errors.push(ReconcileError::fetch("history/containers", e));
            Vec::new()
        });
        if apps.is_empty() && containers.is_empty() {
            return (report, errors);
        }
        report.history_points = apps.len() + containers.len();

        let apps: Arc<[_]> = apps.into();
        let containers: Arc<[_]> = containers.into();
        match self.enqueue("history", move |store| {
            let apps = Arc::clone(&apps);
            let containers = Arc::clone(&containers);
            async move {
                store
                    .update_history(&apps, &containers)
                    .await
                    .context("failed to update history")
            }
        }) {
            Ok(id) => report.jobs.push(id),
            Err(e) => errors.push(e),
        }

        (report, errors)
    }

    /// Queue a job running `task` against the store.
    fn enqueue<F, Fut>(&self, scope: impl Into<String>, task: F) -> Result<Uuid, ReconcileError>
    where
        F: Fn(Arc<dyn PersistenceStore>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let scope = scope.into();
        let store = Arc::clone(&self.store);
        let job = Job::new(move || task(Arc::clone(&store))).named(format!("reconcile/{scope}"));
        self.workqueue.add(job).map_err(|e| {
            warn!(scope = %scope, error = %e, "Failed to queue reconcile job");
            ReconcileError::enqueue(scope, e)
        })
    }
}

fn finish(report: SyncReport, errors: MultiError) -> Result<SyncReport, SyncError> {
    if errors.is_empty() {
        info!(
            partitions = report.partitions,
            queues = report.queues,
            applications = report.applications,
            nodes = report.nodes,
            jobs = report.jobs.len(),
            "Reconciliation queued"
        );
        Ok(report)
    } else {
        warn!(failures = errors.len(), error = %errors, "Reconciliation incomplete");
        Err(SyncError::Partial(errors))
    }
}
