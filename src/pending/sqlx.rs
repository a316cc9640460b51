use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::pending::{DeliveryRecord, KeyValueStore};

/// Postgres-backed key-value store.
///
/// Records live in the `pending_deliveries` table as JSONB, one row per
/// `(namespace, message_id)`.
#[derive(Clone)]
pub struct PgPendingStore {
    pool: PgPool,
}

impl PgPendingStore {
    /// Wraps a pool without touching the schema.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the store and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }
}

#[async_trait]
impl KeyValueStore for PgPendingStore {
    type Error = Error;

    #[tracing::instrument(skip(self, record))]
    async fn put(&self, namespace: &str, key: &str, record: DeliveryRecord) -> Result<(), Error> {
        let recorded_at = record.recorded_at;
        let value = serde_json::to_value(&record)?;

        sqlx::query(
            "INSERT INTO pending_deliveries (namespace, message_id, record, recorded_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (namespace, message_id)
             DO UPDATE SET record = EXCLUDED.record, recorded_at = EXCLUDED.recorded_at",
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .bind(recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, namespace: &str, key: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM pending_deliveries WHERE namespace = $1 AND message_id = $2")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<DeliveryRecord>, Error> {
        let row = sqlx::query(
            "SELECT record FROM pending_deliveries WHERE namespace = $1 AND message_id = $2",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("record")?;
                Ok(Some(serde_json::from_value(value)?))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn list(&self, namespace: &str) -> Result<Vec<DeliveryRecord>, Error> {
        let rows = sqlx::query(
            "SELECT record FROM pending_deliveries \
             WHERE namespace = $1 ORDER BY recorded_at, message_id",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<DeliveryRecord, Error> {
                let value: serde_json::Value = row.try_get("record")?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }
}

/// Ensures the pending deliveries table exists.
async fn create_table(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS pending_deliveries (
            namespace TEXT NOT NULL,
            message_id TEXT NOT NULL,
            record JSONB NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (namespace, message_id)
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Postgres store errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgStoreErrorKind,
}

/// Kinds of Postgres store errors.
#[derive(Debug)]
pub enum PgStoreErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgStoreErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            PgStoreErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgStoreErrorKind::Database(err) => Some(err),
            PgStoreErrorKind::Serde(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStoreErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStoreErrorKind::Serde(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::pending::tests::record;

    #[sqlx::test]
    async fn put_get_and_remove(pool: PgPool) {
        let store = PgPendingStore::try_new(pool).await.unwrap();
        let now = Utc::now();

        store.put("devMQMSG", "m1", record("m1", now)).await.unwrap();

        let fetched = store.get("devMQMSG", "m1").await.unwrap().unwrap();
        assert_eq!(fetched.message_id, "m1");
        assert_eq!(fetched.routing_key, "rk");
        assert!(store.get("prodMQMSG", "m1").await.unwrap().is_none());

        store.remove("devMQMSG", "m1").await.unwrap();
        store.remove("devMQMSG", "m1").await.unwrap();
        assert!(store.get("devMQMSG", "m1").await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn put_upserts_by_namespace_and_id(pool: PgPool) {
        let store = PgPendingStore::try_new(pool.clone()).await.unwrap();
        let now = Utc::now();
        let mut retried = record("m1", now);
        retried.attempt_num = 4;

        store
            .put("devMQMSG", "m1", record("m1", now - Duration::minutes(1)))
            .await
            .unwrap();
        store.put("devMQMSG", "m1", retried).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_deliveries")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let listed = store.list("devMQMSG").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attempt_num, 4);
    }
}
