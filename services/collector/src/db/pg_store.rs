//! Postgres-backed history store.
//!
//! Each entity row keeps the scheduler payload as JSONB. Upserts merge the
//! incoming payload with `jsonb_strip_nulls` so absent fields keep their
//! stored values, and target the partial unique indexes on live rows so a
//! soft-deleted row is never revived.

use async_trait::async_trait;
use sqlx::{
    postgres::{PgPool, PgRow},
    types::Json,
    Postgres, QueryBuilder, Row,
};
use uuid::Uuid;
use yhs_events::{
    AppHistoryEntry, ApplicationInfo, ContainerHistoryEntry, NodeInfo, PartitionInfo,
    PartitionNodesUtil, QueueInfo,
};
use yhs_reconcile::unix_nanos;

use super::DbError;
use crate::store::{
    queue_row, ApplicationRecord, HistoryKind, NodeRecord, PartitionRecord, PersistenceStore,
    QueueRecord, RecordFilters, StoreError,
};

/// [`PersistenceStore`] over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn partition_from_row(row: &PgRow) -> Result<PartitionRecord, sqlx::Error> {
    Ok(PartitionRecord {
        id: row.try_get("id")?,
        created_at_nano: row.try_get("created_at_nano")?,
        deleted_at_nano: row.try_get("deleted_at_nano")?,
        partition: row.try_get::<Json<PartitionInfo>, _>("payload")?.0,
    })
}

fn queue_from_row(row: &PgRow) -> Result<QueueRecord, sqlx::Error> {
    Ok(QueueRecord {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        created_at_nano: row.try_get("created_at_nano")?,
        deleted_at_nano: row.try_get("deleted_at_nano")?,
        queue: row.try_get::<Json<QueueInfo>, _>("payload")?.0,
    })
}

fn node_from_row(row: &PgRow) -> Result<NodeRecord, sqlx::Error> {
    Ok(NodeRecord {
        id: row.try_get("id")?,
        partition: row.try_get("partition")?,
        created_at_nano: row.try_get("created_at_nano")?,
        deleted_at_nano: row.try_get("deleted_at_nano")?,
        node: row.try_get::<Json<NodeInfo>, _>("payload")?.0,
    })
}

fn application_from_row(row: &PgRow) -> Result<ApplicationRecord, sqlx::Error> {
    Ok(ApplicationRecord {
        id: row.try_get("id")?,
        created_at_nano: row.try_get("created_at_nano")?,
        deleted_at_nano: row.try_get("deleted_at_nano")?,
        application: row.try_get::<Json<ApplicationInfo>, _>("payload")?.0,
    })
}

fn push_page(query: &mut QueryBuilder<'_, Postgres>, filters: &RecordFilters) {
    query.push(" ORDER BY created_at_nano, id");
    if let Some(limit) = filters.limit {
        query
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    if filters.offset > 0 {
        query
            .push(" OFFSET ")
            .push_bind(i64::try_from(filters.offset).unwrap_or(i64::MAX));
    }
}

fn db(err: sqlx::Error) -> StoreError {
    StoreError::Db(DbError::Query(err))
}

/// Update the live queue row, returning its id.
async fn update_queue_row(
    conn: &mut sqlx::PgConnection,
    row: &QueueInfo,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        UPDATE queues
        SET payload = payload || jsonb_strip_nulls($3)
        WHERE partition = $1 AND queue_name = $2 AND deleted_at_nano IS NULL
        RETURNING id
        "#,
    )
    .bind(&row.partition)
    .bind(&row.queue_name)
    .bind(Json(row))
    .fetch_optional(conn)
    .await
}

async fn insert_queue_row(
    conn: &mut sqlx::PgConnection,
    parent_id: Option<Uuid>,
    row: &QueueInfo,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO queues (id, parent_id, partition, queue_name, payload, created_at_nano)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(id)
    .bind(parent_id)
    .bind(&row.partition)
    .bind(&row.queue_name)
    .bind(Json(row))
    .bind(unix_nanos())
    .execute(conn)
    .await?;
    Ok(id)
}

/// Walk `children` under the row `parent_id`, updating live rows and
/// inserting missing ones.
async fn sync_children(
    conn: &mut sqlx::PgConnection,
    parent_id: Uuid,
    parent: &QueueInfo,
    partition: &str,
) -> Result<(), sqlx::Error> {
    let mut pending: Vec<(Uuid, &QueueInfo, &QueueInfo)> = parent
        .children
        .iter()
        .map(|child| (parent_id, parent, child))
        .collect();

    while let Some((parent_id, parent, queue)) = pending.pop() {
        let row = queue_row(queue, partition, Some(&parent.queue_name));
        let id = match update_queue_row(conn, &row).await? {
            Some(id) => id,
            None => insert_queue_row(conn, Some(parent_id), &row).await?,
        };
        pending.extend(queue.children.iter().map(|child| (id, queue, child)));
    }
    Ok(())
}

#[async_trait]
impl PersistenceStore for PgStore {
    async fn upsert_partitions(&self, partitions: &[PartitionInfo]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for partition in partitions {
            sqlx::query(
                r#"
                INSERT INTO partitions (id, name, state, payload, created_at_nano)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (name) WHERE deleted_at_nano IS NULL DO UPDATE SET
                    state = COALESCE(EXCLUDED.state, partitions.state),
                    payload = partitions.payload || jsonb_strip_nulls(EXCLUDED.payload)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&partition.name)
            .bind(&partition.state)
            .bind(Json(partition))
            .bind(unix_nanos())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn get_all_partitions(
        &self,
        filters: &RecordFilters,
    ) -> Result<Vec<PartitionRecord>, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT id, payload, created_at_nano, deleted_at_nano FROM partitions WHERE TRUE",
        );
        if !filters.include_deleted {
            query.push(" AND deleted_at_nano IS NULL");
        }
        if let Some(name) = &filters.partition {
            query.push(" AND name = ").push_bind(name.clone());
        }
        if let Some(state) = &filters.state {
            query.push(" AND state = ").push_bind(state.clone());
        }
        push_page(&mut query, filters);

        let rows = query.build().fetch_all(&self.pool).await.map_err(db)?;
        rows.iter()
            .map(partition_from_row)
            .collect::<Result<_, _>>()
            .map_err(db)
    }

    async fn delete_partitions_not_in(
        &self,
        names: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE partitions SET deleted_at_nano = $2
            WHERE deleted_at_nano IS NULL
              AND created_at_nano <= $2
              AND NOT (name = ANY($1))
            "#,
        )
        .bind(names)
        .bind(as_of)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn update_queue(&self, queue: &QueueInfo) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let row = queue_row(queue, &queue.partition, None);
        let id = update_queue_row(&mut *tx, &row)
            .await
            .map_err(db)?
            .ok_or_else(|| StoreError::not_found("queue", &queue.queue_name))?;
        sync_children(&mut *tx, id, queue, &queue.partition)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn add_queues(
        &self,
        parent_id: Option<Uuid>,
        queues: &[QueueInfo],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for queue in queues {
            let row = queue_row(queue, &queue.partition, None);
            let id = insert_queue_row(&mut *tx, parent_id, &row)
                .await
                .map_err(db)?;
            sync_children(&mut *tx, id, queue, &queue.partition)
                .await
                .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn get_queues_in_partition(
        &self,
        partition: &str,
    ) -> Result<Vec<QueueRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, parent_id, payload, created_at_nano, deleted_at_nano
            FROM queues
            WHERE partition = $1 AND deleted_at_nano IS NULL
            ORDER BY queue_name
            "#,
        )
        .bind(partition)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter()
            .map(queue_from_row)
            .collect::<Result<_, _>>()
            .map_err(db)
    }

    async fn delete_queues_not_in(
        &self,
        partition: &str,
        names: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queues SET deleted_at_nano = $3
            WHERE partition = $1
              AND deleted_at_nano IS NULL
              AND created_at_nano <= $3
              AND NOT (queue_name = ANY($2))
            "#,
        )
        .bind(partition)
        .bind(names)
        .bind(as_of)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn upsert_nodes(&self, partition: &str, nodes: &[NodeInfo]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for node in nodes {
            sqlx::query(
                r#"
                INSERT INTO nodes (id, partition, node_id, payload, created_at_nano)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (partition, node_id) WHERE deleted_at_nano IS NULL DO UPDATE SET
                    payload = nodes.payload || jsonb_strip_nulls(EXCLUDED.payload)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(partition)
            .bind(&node.node_id)
            .bind(Json(node))
            .bind(unix_nanos())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn get_nodes_in_partition(&self, partition: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, partition, payload, created_at_nano, deleted_at_nano
            FROM nodes
            WHERE partition = $1 AND deleted_at_nano IS NULL
            ORDER BY node_id
            "#,
        )
        .bind(partition)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter()
            .map(node_from_row)
            .collect::<Result<_, _>>()
            .map_err(db)
    }

    async fn delete_nodes_not_in(
        &self,
        partition: &str,
        ids: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE nodes SET deleted_at_nano = $3
            WHERE partition = $1
              AND deleted_at_nano IS NULL
              AND created_at_nano <= $3
              AND NOT (node_id = ANY($2))
            "#,
        )
        .bind(partition)
        .bind(ids)
        .bind(as_of)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn upsert_applications(&self, apps: &[ApplicationInfo]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for app in apps {
            // A snapshot older than the stored state log only fills in
            // fields; it never rewinds the state.
            sqlx::query(
                r#"
                INSERT INTO applications (
                    id, app_id, partition, queue_name, state,
                    last_transition_nano, payload, created_at_nano
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (app_id) WHERE deleted_at_nano IS NULL DO UPDATE SET
                    partition = EXCLUDED.partition,
                    queue_name = EXCLUDED.queue_name,
                    state = CASE
                        WHEN COALESCE(EXCLUDED.last_transition_nano, 0)
                             >= COALESCE(applications.last_transition_nano, 0)
                        THEN EXCLUDED.state
                        ELSE applications.state
                    END,
                    payload = CASE
                        WHEN COALESCE(EXCLUDED.last_transition_nano, 0)
                             >= COALESCE(applications.last_transition_nano, 0)
                        THEN applications.payload || jsonb_strip_nulls(EXCLUDED.payload)
                        ELSE applications.payload
                             || (jsonb_strip_nulls(EXCLUDED.payload) - 'applicationState' - 'stateLog')
                    END,
                    last_transition_nano = GREATEST(
                        applications.last_transition_nano,
                        EXCLUDED.last_transition_nano
                    )
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&app.id)
            .bind(&app.partition)
            .bind(&app.queue_name)
            .bind(&app.state)
            .bind(app.last_transition_nano())
            .bind(Json(app))
            .bind(unix_nanos())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn get_all_applications(
        &self,
        filters: &RecordFilters,
    ) -> Result<Vec<ApplicationRecord>, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT id, payload, created_at_nano, deleted_at_nano FROM applications WHERE TRUE",
        );
        if !filters.include_deleted {
            query.push(" AND deleted_at_nano IS NULL");
        }
        if let Some(partition) = &filters.partition {
            query.push(" AND partition = ").push_bind(partition.clone());
        }
        if let Some(queue) = &filters.queue {
            query.push(" AND queue_name = ").push_bind(queue.clone());
        }
        if let Some(state) = &filters.state {
            query.push(" AND state = ").push_bind(state.clone());
        }
        push_page(&mut query, filters);

        let rows = query.build().fetch_all(&self.pool).await.map_err(db)?;
        rows.iter()
            .map(application_from_row)
            .collect::<Result<_, _>>()
            .map_err(db)
    }

    async fn get_application(&self, id: &str) -> Result<Option<ApplicationRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, payload, created_at_nano, deleted_at_nano
            FROM applications
            WHERE app_id = $1
            ORDER BY deleted_at_nano DESC NULLS FIRST
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref()
            .map(application_from_row)
            .transpose()
            .map_err(db)
    }

    async fn delete_applications_not_in(
        &self,
        ids: &[String],
        as_of: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE applications SET deleted_at_nano = $2
            WHERE deleted_at_nano IS NULL
              AND created_at_nano <= $2
              AND NOT (app_id = ANY($1))
            "#,
        )
        .bind(ids)
        .bind(as_of)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn insert_node_utilizations(
        &self,
        utilizations: &[PartitionNodesUtil],
    ) -> Result<(), StoreError> {
        let now = unix_nanos();
        let mut tx = self.pool.begin().await.map_err(db)?;
        for utilization in utilizations {
            sqlx::query(
                r#"
                INSERT INTO node_utilizations (id, partition, payload, created_at_nano)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&utilization.partition)
            .bind(Json(utilization))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
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

        let mut tx = self.pool.begin().await.map_err(db)?;
        for (kind, timestamp, total_number) in points {
            sqlx::query(
                r#"
                INSERT INTO history (id, history_type, total_number, timestamp)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (history_type, timestamp) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(kind.as_str())
            .bind(total_number)
            .bind(timestamp)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }
}
