//! Postgres-backed outbox store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`: rows locked by a concurrent claimer are
//! skipped rather than waited on, so parallel workers never receive the same
//! row and never block each other.
//!
//! ## Error Mapping
//!
//! Every SQLx error is wrapped as `OutboxError::Database` together with the
//! operation name; a status value the enum does not know maps to `Storage`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::{Span, instrument};

use super::message::{OutboxKind, OutboxMessage, OutboxStatus};
use super::store::{OutboxError, OutboxStore, StatusCounts};
use crate::db::PgTx;

/// Outbox stored in the `outbox` table (see `migrations/0001_outbox.sql`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresOutboxStore;

impl PostgresOutboxStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    type Tx = PgTx;

    #[instrument(skip(self, tx, payload), fields(kind = %kind), err)]
    async fn enqueue(
        &self,
        tx: &mut PgTx,
        idempotency_key: &str,
        kind: OutboxKind,
        payload: &[u8],
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO outbox (idempotency_key, data, status, kind)
            VALUES ($1, $2, 'CREATED', $3)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(idempotency_key)
        .bind(payload)
        .bind(kind.as_i32())
        .execute(&mut **tx)
        .await
        .map_err(|e| OutboxError::database("enqueue", e))?;

        Ok(())
    }

    #[instrument(skip(self, tx), fields(claimed = tracing::field::Empty), err)]
    async fn claim_batch(
        &self,
        tx: &mut PgTx,
        max_count: usize,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'IN_PROGRESS', updated_at = now()
            WHERE idempotency_key IN (
                SELECT idempotency_key
                FROM outbox
                WHERE status = 'CREATED'
                   OR (status = 'IN_PROGRESS'
                       AND updated_at < now() - make_interval(secs => $1))
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING idempotency_key, data, kind, created_at
            "#,
        )
        .bind(lease_ttl.as_secs_f64())
        .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| OutboxError::database("claim_batch", e))?;

        // RETURNING does not preserve the subquery's order.
        let mut claimed = rows
            .iter()
            .map(ClaimedRow::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| OutboxError::database("claim_batch", e))?;
        claimed.sort_by_key(|row| row.created_at);

        Span::current().record("claimed", claimed.len());
        Ok(claimed.into_iter().map(|row| row.message).collect())
    }

    #[instrument(skip(self, tx, keys), fields(keys = keys.len()), err)]
    async fn mark_complete(&self, tx: &mut PgTx, keys: &[String]) -> Result<(), OutboxError> {
        if keys.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'SUCCESS', updated_at = now()
            WHERE idempotency_key = ANY($1)
              AND status <> 'SUCCESS'
            "#,
        )
        .bind(keys)
        .execute(&mut **tx)
        .await
        .map_err(|e| OutboxError::database("mark_complete", e))?;

        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn status_counts(&self, tx: &mut PgTx) -> Result<StatusCounts, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT status::text AS status, COUNT(*) AS total
            FROM outbox
            GROUP BY status
            "#,
        )
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| OutboxError::database("status_counts", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| OutboxError::database("status_counts", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| OutboxError::database("status_counts", e))?;
            let status = OutboxStatus::parse(&status)
                .ok_or_else(|| OutboxError::Storage(format!("unknown outbox status {status}")))?;
            counts.add(status, u64::try_from(total).unwrap_or(0));
        }
        Ok(counts)
    }
}

struct ClaimedRow {
    message: OutboxMessage,
    created_at: DateTime<Utc>,
}

impl ClaimedRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let kind: i32 = row.try_get("kind")?;
        Ok(Self {
            message: OutboxMessage {
                idempotency_key: row.try_get("idempotency_key")?,
                kind: OutboxKind::from_i32(kind),
                payload: row.try_get("data")?,
            },
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PgTransactor, Transactor, connect, run_migrations};

    /// Claims are table-wide, so tests that claim must not interleave.
    static CLAIMS: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    const WIDE: usize = 10_000;

    async fn setup() -> PgTransactor {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = connect(&url, 4).await.unwrap();
        run_migrations(&pool).await.unwrap();
        PgTransactor::new(pool)
    }

    fn unique_key(prefix: &str) -> String {
        format!("{prefix}_{}", uuid::Uuid::now_v7())
    }

    async fn enqueue_committed(transactor: &PgTransactor, key: &str) {
        let mut tx = transactor.begin().await.unwrap();
        PostgresOutboxStore::new()
            .enqueue(&mut tx, key, OutboxKind::Book, b"{}")
            .await
            .unwrap();
        transactor.commit(tx).await.unwrap();
    }

    /// Claim every due row in a fresh transaction, commit, and report whether `key` was among them.
    async fn claim_committed(transactor: &PgTransactor, key: &str, ttl: Duration) -> bool {
        let mut tx = transactor.begin().await.unwrap();
        let claimed = PostgresOutboxStore::new()
            .claim_batch(&mut tx, WIDE, ttl)
            .await
            .unwrap();
        transactor.commit(tx).await.unwrap();
        claimed.iter().any(|m| m.idempotency_key == key)
    }

    async fn row_state(transactor: &PgTransactor, key: &str) -> (String, DateTime<Utc>) {
        let mut tx = transactor.begin().await.unwrap();
        let row = sqlx::query(
            "SELECT status::text AS status, updated_at FROM outbox WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await
        .unwrap();
        let state = (row.try_get("status").unwrap(), row.try_get("updated_at").unwrap());
        transactor.rollback(tx).await.unwrap();
        state
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn duplicate_enqueue_is_a_no_op() {
        let transactor = setup().await;
        let store = PostgresOutboxStore::new();
        let key = unique_key("book");

        let mut tx = transactor.begin().await.unwrap();
        store.enqueue(&mut tx, &key, OutboxKind::Book, b"a").await.unwrap();
        store.enqueue(&mut tx, &key, OutboxKind::Author, b"b").await.unwrap();

        let row = sqlx::query("SELECT kind, data FROM outbox WHERE idempotency_key = $1")
            .bind(&key)
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        let kind: i32 = row.try_get("kind").unwrap();
        let data: Vec<u8> = row.try_get("data").unwrap();
        assert_eq!(OutboxKind::from_i32(kind), OutboxKind::Book);
        assert_eq!(data, b"a");
        transactor.rollback(tx).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn concurrent_claimers_skip_locked_rows() {
        let _serial = CLAIMS.lock().await;
        let transactor = setup().await;
        let store = PostgresOutboxStore::new();
        let key = unique_key("author");

        let mut tx = transactor.begin().await.unwrap();
        store.enqueue(&mut tx, &key, OutboxKind::Author, b"{}").await.unwrap();
        transactor.commit(tx).await.unwrap();

        let ttl = Duration::from_secs(3600);
        let mut first = transactor.begin().await.unwrap();
        let mut second = transactor.begin().await.unwrap();
        let a = store.claim_batch(&mut first, 1000, ttl).await.unwrap();
        let b = store.claim_batch(&mut second, 1000, ttl).await.unwrap();

        let in_a = a.iter().any(|m| m.idempotency_key == key);
        let in_b = b.iter().any(|m| m.idempotency_key == key);
        assert!(in_a ^ in_b, "exactly one claimer must get the row");

        store.mark_complete(&mut first, &[key.clone()]).await.unwrap();
        transactor.commit(first).await.unwrap();
        transactor.rollback(second).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn lease_is_reclaimable_only_after_ttl() {
        let _serial = CLAIMS.lock().await;
        let transactor = setup().await;
        let key = unique_key("book");
        let ttl = Duration::from_secs(1);
        enqueue_committed(&transactor, &key).await;

        assert!(claim_committed(&transactor, &key, ttl).await);
        assert_eq!(row_state(&transactor, &key).await.0, "IN_PROGRESS");

        assert!(!claim_committed(&transactor, &key, ttl).await, "lease still held");

        tokio::time::sleep(ttl + Duration::from_millis(200)).await;
        assert!(claim_committed(&transactor, &key, ttl).await, "expired lease must be reclaimed");

        let mut tx = transactor.begin().await.unwrap();
        PostgresOutboxStore::new()
            .mark_complete(&mut tx, &[key.clone()])
            .await
            .unwrap();
        transactor.commit(tx).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn completed_rows_are_never_reclaimed_or_rewritten() {
        let _serial = CLAIMS.lock().await;
        let transactor = setup().await;
        let store = PostgresOutboxStore::new();
        let key = unique_key("book");
        let unknown = unique_key("book");
        enqueue_committed(&transactor, &key).await;

        let mut tx = transactor.begin().await.unwrap();
        let claimed = store.claim_batch(&mut tx, WIDE, Duration::ZERO).await.unwrap();
        assert!(claimed.iter().any(|m| m.idempotency_key == key));
        store
            .mark_complete(&mut tx, &[key.clone(), unknown.clone()])
            .await
            .unwrap();
        transactor.commit(tx).await.unwrap();

        let (status, completed_at) = row_state(&transactor, &key).await;
        assert_eq!(status, "SUCCESS");

        let mut tx = transactor.begin().await.unwrap();
        store.mark_complete(&mut tx, &[key.clone()]).await.unwrap();
        transactor.commit(tx).await.unwrap();
        assert!(!claim_committed(&transactor, &key, Duration::ZERO).await);

        assert_eq!(row_state(&transactor, &key).await, ("SUCCESS".to_string(), completed_at));
    }
}
