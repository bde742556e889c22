//! Postgres-backed key-value cache.

use super::Db;
use crate::error::Result;
use crate::store::KvBackend;
use crate::telemetry::metrics;
use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry::KeyValue;

pub struct PgKv {
    db: Db,
}

impl PgKv {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn record_op(operation: &'static str) {
        metrics::cache_operations().add(
            1,
            &[
                KeyValue::new("backend", "postgres"),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

#[async_trait]
impl KvBackend for PgKv {
    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value.as_ref())
        .execute(self.db.pool())
        .await?;
        Self::record_op("set");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_entries WHERE key = $1")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        Self::record_op(if row.is_some() { "get" } else { "get_miss" });
        Ok(row.map(|(value,)| Bytes::from(value)))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM kv_entries")
            .fetch_all(self.db.pool())
            .await?;
        Self::record_op("keys");
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Self::record_op("delete");
        Ok(affected > 0)
    }
}
