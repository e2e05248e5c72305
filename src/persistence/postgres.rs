use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use super::traits::{CasOutcome, MessageStore, QueueRegistryStore, RegistryChange};
use crate::domain::{
    BrokerEnvironment, MessageRecord, MessageStatus, MovementType, QueueDirection, QueuePurpose,
    QueueRegistryEntry,
};
use crate::error::{Result, SyncError};

/// Partial unique index allowing one RECE and one DELI per correlation id
const PAIR_LEG_INDEX: &str = "uq_broker_messages_pair_leg";

const MESSAGE_COLUMNS: &str = r#"
    message_id, transaction_id, linked_transaction_id, common_reference_id,
    movement_type, status, environment, queue_name, body, error_message,
    version, created_at, sent_at, received_at, processed_at
"#;

const REGISTRY_COLUMNS: &str = r#"
    name, path, queue_type, direction, purpose, message_count, active,
    last_sync_time, created_at
"#;

/// PostgreSQL storage for the queue registry and message audit trail
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_in(tx: &mut Transaction<'_, Postgres>, entry: &QueueRegistryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_registry (
                name, path, queue_type, direction, purpose, message_count, active,
                last_sync_time, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (name) DO UPDATE SET
                path = EXCLUDED.path,
                queue_type = EXCLUDED.queue_type,
                direction = EXCLUDED.direction,
                purpose = EXCLUDED.purpose,
                message_count = EXCLUDED.message_count,
                active = EXCLUDED.active,
                last_sync_time = EXCLUDED.last_sync_time
            "#,
        )
        .bind(&entry.name)
        .bind(&entry.path)
        .bind(&entry.queue_type)
        .bind(entry.direction.as_str())
        .bind(entry.purpose.as_str())
        .bind(entry.message_count)
        .bind(entry.active)
        .bind(entry.last_sync_time)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_in(tx: &mut Transaction<'_, Postgres>, record: &MessageRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO broker_messages (
                message_id, transaction_id, linked_transaction_id, common_reference_id,
                movement_type, status, environment, queue_name, body, error_message,
                version, created_at, sent_at, received_at, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&record.message_id)
        .bind(&record.transaction_id)
        .bind(&record.linked_transaction_id)
        .bind(&record.common_reference_id)
        .bind(record.movement_type.as_str())
        .bind(record.status.as_str())
        .bind(record.environment.as_str())
        .bind(&record.queue_name)
        .bind(&record.body)
        .bind(&record.error_message)
        .bind(record.version)
        .bind(record.created_at)
        .bind(record.sent_at)
        .bind(record.received_at)
        .bind(record.processed_at)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                if db.constraint() == Some(PAIR_LEG_INDEX) {
                    Err(SyncError::Correlation(format!(
                        "correlation id already in use: {}",
                        record.common_reference_id.as_deref().unwrap_or_default()
                    )))
                } else {
                    Err(SyncError::DuplicateTransaction(record.transaction_id.clone()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: for<'a> TryFrom<&'a str, Error = String>,
{
    let raw: String = row.get(column);
    T::try_from(raw.as_str()).map_err(SyncError::Internal)
}

fn row_to_entry(row: &PgRow) -> Result<QueueRegistryEntry> {
    Ok(QueueRegistryEntry {
        name: row.get("name"),
        path: row.get("path"),
        queue_type: row.get("queue_type"),
        direction: parse_column::<QueueDirection>(row, "direction")?,
        purpose: parse_column::<QueuePurpose>(row, "purpose")?,
        message_count: row.get("message_count"),
        active: row.get("active"),
        last_sync_time: row.get("last_sync_time"),
        created_at: row.get("created_at"),
    })
}

fn row_to_record(row: &PgRow) -> Result<MessageRecord> {
    Ok(MessageRecord {
        message_id: row.get("message_id"),
        transaction_id: row.get("transaction_id"),
        linked_transaction_id: row.get("linked_transaction_id"),
        common_reference_id: row.get("common_reference_id"),
        movement_type: parse_column::<MovementType>(row, "movement_type")?,
        status: parse_column::<MessageStatus>(row, "status")?,
        environment: parse_column::<BrokerEnvironment>(row, "environment")?,
        queue_name: row.get("queue_name"),
        body: row.get("body"),
        error_message: row.get("error_message"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        sent_at: row.get("sent_at"),
        received_at: row.get("received_at"),
        processed_at: row.get("processed_at"),
    })
}

// ==================== Queue registry ====================

#[async_trait]
impl QueueRegistryStore for PostgresStore {
    async fn list_all(&self) -> Result<Vec<QueueRegistryEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM queue_registry ORDER BY name",
            REGISTRY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn get(&self, name: &str) -> Result<Option<QueueRegistryEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM queue_registry WHERE name = $1",
            REGISTRY_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    #[instrument(skip(self, entry), fields(queue = %entry.name))]
    async fn upsert(&self, entry: &QueueRegistryEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_in(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_batch(&self, changes: &[RegistryChange]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for change in changes {
            match change {
                RegistryChange::Upsert(entry) => Self::upsert_in(&mut tx, entry).await?,
                RegistryChange::Deactivate { name } => {
                    sqlx::query("UPDATE queue_registry SET active = FALSE WHERE name = $1")
                        .bind(name)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        debug!("Applied {} registry changes", changes.len());
        Ok(())
    }

    async fn mark_inactive(&self, name: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE queue_registry SET active = FALSE WHERE name = $1 AND active")
                .bind(name)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_inactive(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM queue_registry WHERE NOT active AND last_sync_time < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn find_stale(&self, since: DateTime<Utc>) -> Result<Vec<QueueRegistryEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM queue_registry WHERE last_sync_time < $1 ORDER BY last_sync_time",
            REGISTRY_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }
}

// ==================== Messages ====================

#[async_trait]
impl MessageStore for PostgresStore {
    #[instrument(skip(self, record), fields(tx = %record.transaction_id))]
    async fn insert(&self, record: &MessageRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_in(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_pair(&self, first: &MessageRecord, second: &MessageRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_in(&mut tx, first).await?;
        Self::insert_in(&mut tx, second).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_by_transaction_id(&self, transaction_id: &str) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM broker_messages WHERE transaction_id = $1",
            MESSAGE_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn get_by_message_id(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM broker_messages WHERE message_id = $1 ORDER BY id LIMIT 1",
            MESSAGE_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn find_by_common_reference_id(&self, reference_id: &str) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM broker_messages WHERE common_reference_id = $1 ORDER BY transaction_id",
            MESSAGE_COLUMNS
        ))
        .bind(reference_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn compare_and_swap(&self, records: &[MessageRecord]) -> Result<CasOutcome> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            let result = sqlx::query(
                r#"
                UPDATE broker_messages SET
                    message_id = $3,
                    status = $4,
                    error_message = $5,
                    sent_at = $6,
                    received_at = $7,
                    processed_at = $8,
                    version = version + 1
                WHERE transaction_id = $1 AND version = $2
                "#,
            )
            .bind(&record.transaction_id)
            .bind(record.version)
            .bind(&record.message_id)
            .bind(record.status.as_str())
            .bind(&record.error_message)
            .bind(record.sent_at)
            .bind(record.received_at)
            .bind(record.processed_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                let exists = sqlx::query("SELECT 1 FROM broker_messages WHERE transaction_id = $1")
                    .bind(&record.transaction_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .is_some();
                tx.rollback().await?;

                return Ok(if exists {
                    CasOutcome::Conflict(record.transaction_id.clone())
                } else {
                    CasOutcome::NotFound(record.transaction_id.clone())
                });
            }
        }

        tx.commit().await?;
        Ok(CasOutcome::Applied)
    }

    async fn list_by_status(&self, status: MessageStatus, limit: i64) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM broker_messages WHERE status = $1 ORDER BY created_at LIMIT $2",
            MESSAGE_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn count_by_status(&self) -> Result<HashMap<MessageStatus, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM broker_messages GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in &rows {
            counts.insert(parse_column::<MessageStatus>(row, "status")?, row.get("n"));
        }
        Ok(counts)
    }
}
