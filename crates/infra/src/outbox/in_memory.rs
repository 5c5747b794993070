//! In-memory outbox store (tests/dev).

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::message::{OutboxKind, OutboxMessage, OutboxRecord, OutboxStatus};
use super::store::{OutboxError, OutboxStore, StatusCounts};
use crate::db::MemoryTx;

/// Outbox over the `outbox` table of an [`InMemoryDatabase`](crate::db::InMemoryDatabase).
///
/// Claims go through the database's claim set, so concurrent claimers skip
/// each other's rows instead of waiting for them.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryOutboxStore;

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Tx = MemoryTx;

    async fn enqueue(
        &self,
        tx: &mut MemoryTx,
        idempotency_key: &str,
        kind: OutboxKind,
        payload: &[u8],
    ) -> Result<(), OutboxError> {
        let now = tx.now();
        let record = OutboxRecord::created(idempotency_key, kind, payload.to_vec(), now);
        if !tx.insert_outbox(record) {
            debug!(idempotency_key, "outbox key already present, enqueue skipped");
        }
        Ok(())
    }

    async fn claim_batch(
        &self,
        tx: &mut MemoryTx,
        max_count: usize,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let now = tx.now();

        let keys = tx.claim_outbox_rows(|rows| {
            let mut due: Vec<&OutboxRecord> = rows
                .iter()
                .copied()
                .filter(|r| r.is_claimable(now, lease_ttl))
                .collect();
            // Stable sort: rows created at the same instant keep insertion order.
            due.sort_by_key(|r| r.created_at);
            due.truncate(max_count);
            due.into_iter().map(|r| r.idempotency_key.clone()).collect()
        });

        let mut claimed = Vec::with_capacity(keys.len());
        for key in &keys {
            let row = tx.update_outbox(key, |row| {
                row.status = OutboxStatus::InProgress;
                row.updated_at = now;
                true
            });
            claimed.extend(row.map(OutboxRecord::to_message));
        }
        Ok(claimed)
    }

    async fn mark_complete(&self, tx: &mut MemoryTx, keys: &[String]) -> Result<(), OutboxError> {
        if keys.is_empty() {
            return Ok(());
        }
        let now = tx.now();
        tx.refresh_outbox();
        for key in keys {
            tx.update_outbox(key, |row| {
                if row.status == OutboxStatus::Success {
                    return false;
                }
                row.status = OutboxStatus::Success;
                row.updated_at = now;
                true
            });
        }
        Ok(())
    }

    async fn status_counts(&self, tx: &mut MemoryTx) -> Result<StatusCounts, OutboxError> {
        tx.refresh_outbox();
        let mut counts = StatusCounts::default();
        for row in &tx.tables().outbox {
            counts.add(row.status, 1);
        }
        Ok(counts)
    }
}
