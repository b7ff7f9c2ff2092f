//! Postgres record store, migrations, and health check.
//!
//! The connection pool is shared with the pgmq queues. The change stream is
//! the `item_changes` table, filled by a trigger on `items`, so every
//! committed mutation appears in it exactly once. The trigger serializes
//! writers until commit, so sequence order is commit order and a reader's
//! cursor never passes a change that is still to become visible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{ChangeRecord, ChangeStream, Operation, RecordStore};
use crate::error::{Error, Result};
use crate::model::{ItemFields, ItemRecord};

/// Record store handle. Owns the connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// The shared pool, for queues living in the same database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Connection-level failures are transient from a consumer's point of view.
fn store_error(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::Store(e.to_string()),
        other => Error::Database(other),
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert(&self, item_id: &str, fields: ItemFields) -> Result<ItemRecord> {
        let row: ItemRow = sqlx::query_as(
            "INSERT INTO items (item_id, description) VALUES ($1, $2)
             ON CONFLICT (item_id) DO UPDATE
                SET description = EXCLUDED.description, updated_at = now()
             RETURNING item_id, description, created_at, updated_at",
        )
        .bind(item_id)
        .bind(&fields.description)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(row.into())
    }

    async fn get(&self, item_id: &str) -> Result<Option<ItemRecord>> {
        let row: Option<ItemRow> = sqlx::query_as(
            "SELECT item_id, description, created_at, updated_at FROM items WHERE item_id = $1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(row.map(ItemRecord::from))
    }

    async fn delete(&self, item_id: &str) -> Result<Option<ItemRecord>> {
        let row: Option<ItemRow> = sqlx::query_as(
            "DELETE FROM items WHERE item_id = $1
             RETURNING item_id, description, created_at, updated_at",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(row.map(ItemRecord::from))
    }

    async fn set_description(&self, item_id: &str, description: &str) -> Result<ItemRecord> {
        let row: Option<ItemRow> = sqlx::query_as(
            "UPDATE items SET description = $2, updated_at = now() WHERE item_id = $1
             RETURNING item_id, description, created_at, updated_at",
        )
        .bind(item_id)
        .bind(description)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        row.map(ItemRecord::from)
            .ok_or_else(|| Error::NotFound(item_id.to_string()))
    }
}

#[async_trait]
impl ChangeStream for PgStore {
    async fn read_after(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(
            "SELECT seq, operation, before, after, recorded_at FROM item_changes
             WHERE seq > $1 ORDER BY seq LIMIT $2",
        )
        .bind(after as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.into_iter().map(ChangeRow::try_into_change).collect()
    }

    async fn latest_sequence(&self) -> Result<u64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT max(seq) FROM item_changes")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.0.unwrap_or(0) as u64)
    }

    async fn trim(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM item_changes WHERE recorded_at < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await
            .map_err(store_error)?
            .rows_affected();
        Ok(removed)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ItemRow {
    item_id: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ItemRow> for ItemRecord {
    fn from(row: ItemRow) -> Self {
        Self {
            item_id: row.item_id,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    seq: i64,
    operation: String,
    before: Option<serde_json::Value>,
    after: Option<serde_json::Value>,
    recorded_at: DateTime<Utc>,
}

impl ChangeRow {
    fn try_into_change(self) -> Result<ChangeRecord> {
        let image = |value: Option<serde_json::Value>| -> Result<Option<ItemRecord>> {
            value.map(serde_json::from_value).transpose().map_err(Error::from)
        };
        Ok(ChangeRecord {
            sequence: self.seq as u64,
            operation: self.operation.parse::<Operation>()?,
            before: image(self.before)?,
            after: image(self.after)?,
            recorded_at: self.recorded_at,
        })
    }
}
