// SQLite-backed ExecutionStore
//
// One row per node execution: scalar columns for everything a NodeQuery can
// filter on, plus the full record as a JSON document. Conditional writes are
// version-guarded UPDATEs; a lost race re-reads the row and re-checks the
// caller's filter before trying again.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use super::{
    ExecutionStore, NodeQuery, NodeUpdate, Sort, StoreError, StoreResult, TimeoutFilter, UpdateAck,
};
use crate::execution::types::NodeExecution;

pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Connect, creating the database file when missing
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        auto_migrate: bool,
    ) -> StoreResult<Self> {
        if !Sqlite::database_exists(database_url).await? {
            info!("Creating execution database at {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        if auto_migrate {
            info!("Running execution store migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Execution store migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn select(&self, query: &NodeQuery, limit: Option<i64>) -> StoreResult<Vec<NodeExecution>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT document FROM node_executions");
        push_filter(&mut builder, query);
        match query.sort {
            Sort::Natural => builder.push(" ORDER BY seq ASC"),
            Sort::CreatedAtDesc => builder.push(" ORDER BY created_at DESC, seq ASC"),
        };
        if let Some(limit) = limit {
            builder.push(" LIMIT ").push_bind(limit);
        }
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode).collect()
    }

    async fn write_row<'e, E>(executor: E, record: &NodeExecution, expected_version: u64) -> StoreResult<bool>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let document = serde_json::to_string(record)?;
        let result = sqlx::query(
            r#"
            UPDATE node_executions
            SET status = ?1, old_retry = ?2, previous_id = ?3, version = ?4, document = ?5
            WHERE id = ?6 AND version = ?7
            "#,
        )
        .bind(record.status.to_string())
        .bind(record.old_retry)
        .bind(record.previous_id.clone())
        .bind(record.version.unwrap_or_default() as i64)
        .bind(document)
        .bind(record.id.clone())
        .bind(expected_version as i64)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_row<'e, E>(executor: E, record: &NodeExecution) -> StoreResult<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let document = serde_json::to_string(record)?;
        let result = sqlx::query(
            r#"
            INSERT INTO node_executions
                (id, plan_execution_id, plan_node_id, parent_id, previous_id, notify_id,
                 status, old_retry, version, created_at, document)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(record.id.clone())
        .bind(record.plan_execution_id.clone())
        .bind(record.plan_node_id.clone())
        .bind(record.parent_id.clone())
        .bind(record.previous_id.clone())
        .bind(record.notify_id.clone())
        .bind(record.status.to_string())
        .bind(record.old_retry)
        .bind(0_i64)
        .bind(record.created_at.timestamp_micros())
        .bind(document)
        .execute(executor)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::DuplicateKey {
                id: record.id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn decode(row: &SqliteRow) -> StoreResult<NodeExecution> {
    let document: String = row.try_get("document")?;
    Ok(serde_json::from_str(&document)?)
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, query: &NodeQuery) {
    builder.push(" WHERE 1 = 1");
    if let Some(id) = &query.id {
        builder.push(" AND id = ").push_bind(id.clone());
    }
    if let Some(ids) = &query.ids {
        if ids.is_empty() {
            builder.push(" AND 0 = 1");
        } else {
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");
        }
    }
    if let Some(excluded) = &query.exclude_id {
        builder.push(" AND id <> ").push_bind(excluded.clone());
    }
    if let Some(plan) = &query.plan_execution_id {
        builder.push(" AND plan_execution_id = ").push_bind(plan.clone());
    }
    if let Some(plan_node) = &query.plan_node_id {
        builder.push(" AND plan_node_id = ").push_bind(plan_node.clone());
    }
    if let Some(parent) = &query.parent_id {
        builder.push(" AND parent_id = ").push_bind(parent.clone());
    }
    if let Some(notify) = &query.notify_id {
        builder.push(" AND notify_id = ").push_bind(notify.clone());
    }
    if let Some(previous) = &query.previous_id {
        builder.push(" AND previous_id = ").push_bind(previous.clone());
    }
    if let Some(statuses) = &query.status_in {
        if statuses.is_empty() {
            builder.push(" AND 0 = 1");
        } else {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in statuses {
                separated.push_bind(status.to_string());
            }
            separated.push_unseparated(")");
        }
    }
    if let Some(old_retry) = query.old_retry {
        builder.push(" AND old_retry = ").push_bind(old_retry);
    }
    match &query.timeout {
        None => {}
        Some(TimeoutFilter::Unstamped) => {
            builder.push(" AND json_extract(document, '$.timeout_details') IS NULL");
        }
        Some(TimeoutFilter::AwaitingInterrupt(id)) => {
            builder
                .push(" AND json_extract(document, '$.timeout_details.timeout_instance_id') = ")
                .push_bind(id.clone())
                .push(" AND json_extract(document, '$.timeout_details.interrupt_id') IS NULL");
        }
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn insert(&self, mut record: NodeExecution) -> StoreResult<NodeExecution> {
        record.version = Some(0);
        Self::insert_row(&self.pool, &record).await?;
        Ok(record)
    }

    async fn insert_many(&self, records: Vec<NodeExecution>) -> StoreResult<Vec<NodeExecution>> {
        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(records.len());
        for mut record in records {
            record.version = Some(0);
            Self::insert_row(&mut *tx, &record).await?;
            saved.push(record);
        }
        tx.commit().await?;
        Ok(saved)
    }

    async fn replace(&self, mut record: NodeExecution) -> StoreResult<Option<NodeExecution>> {
        let Some(expected) = record.version else {
            return Ok(None);
        };
        let Some(current) = self.get(&record.id).await? else {
            return Ok(None);
        };
        record.created_at = current.created_at;
        record.last_updated_at = Utc::now();
        record.version = Some(expected + 1);
        if Self::write_row(&self.pool, &record, expected).await? {
            Ok(Some(record))
        } else {
            debug!(node_execution_id = %record.id, "Replace rejected on version mismatch");
            Ok(None)
        }
    }

    async fn get(&self, id: &str) -> StoreResult<Option<NodeExecution>> {
        let row = sqlx::query("SELECT document FROM node_executions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn find(&self, query: &NodeQuery) -> StoreResult<Vec<NodeExecution>> {
        self.select(query, None).await
    }

    async fn count(&self, query: &NodeQuery) -> StoreResult<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM node_executions");
        push_filter(&mut builder, query);
        let row = builder.build().fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(total as u64)
    }

    async fn find_and_modify(
        &self,
        filter: &NodeQuery,
        update: &NodeUpdate,
    ) -> StoreResult<Option<NodeExecution>> {
        loop {
            let Some(mut record) = self.select(filter, Some(1)).await?.into_iter().next() else {
                return Ok(None);
            };
            let expected = record.version.unwrap_or_default();
            update.apply(&mut record, Utc::now());
            if Self::write_row(&self.pool, &record, expected).await? {
                return Ok(Some(record));
            }
            debug!(node_execution_id = %record.id, "Lost conditional write race, re-checking filter");
        }
    }

    /// Rows that lose their version check are re-read inside the
    /// transaction and written again while they still match `filter`, so
    /// `modified` only falls short of `matched` for rows another writer
    /// moved out of the filter.
    async fn update_many(&self, filter: &NodeQuery, update: &NodeUpdate) -> StoreResult<UpdateAck> {
        let mut tx = self.pool.begin().await?;
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT document FROM node_executions");
        push_filter(&mut builder, filter);
        let rows = builder.build().fetch_all(&mut *tx).await?;

        let now = Utc::now();
        let mut matched = 0;
        let mut modified = 0;
        for row in &rows {
            let mut current = decode(row)?;
            matched += 1;
            loop {
                let expected = current.version.unwrap_or_default();
                let mut record = current.clone();
                update.apply(&mut record, now);
                if Self::write_row(&mut *tx, &record, expected).await? {
                    modified += 1;
                    break;
                }
                let reread = sqlx::query("SELECT document FROM node_executions WHERE id = ?1")
                    .bind(current.id.clone())
                    .fetch_optional(&mut *tx)
                    .await?;
                match reread.as_ref().map(decode).transpose()? {
                    Some(latest) if filter.matches(&latest) => {
                        debug!(node_execution_id = %latest.id, "Bulk write lost version check, retrying");
                        current = latest;
                    }
                    _ => {
                        debug!(node_execution_id = %current.id, "Row left the filter during bulk update");
                        break;
                    }
                }
            }
        }
        tx.commit().await?;
        Ok(UpdateAck::acknowledged(matched, modified))
    }
}
