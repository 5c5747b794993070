//! Outbox storage abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::message::{OutboxKind, OutboxMessage, OutboxStatus};
use crate::db::TxError;

/// Durable queue of outgoing messages.
///
/// Every operation runs inside the caller's transaction. The store never opens,
/// commits or rolls back one itself.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Transaction handle of the backend this store writes to.
    type Tx: Send + 'static;

    /// Insert a `CREATED` row. An existing key makes this a no-op success.
    async fn enqueue(
        &self,
        tx: &mut Self::Tx,
        idempotency_key: &str,
        kind: OutboxKind,
        payload: &[u8],
    ) -> Result<(), OutboxError>;

    /// Move up to `max_count` due rows (oldest first) to `IN_PROGRESS` and return them.
    ///
    /// Due means `CREATED`, or `IN_PROGRESS` with a lease older than `lease_ttl`.
    /// Concurrent claimers never receive the same row.
    async fn claim_batch(
        &self,
        tx: &mut Self::Tx,
        max_count: usize,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxMessage>, OutboxError>;

    /// Mark rows `SUCCESS`. Unknown and already-complete keys are ignored.
    async fn mark_complete(&self, tx: &mut Self::Tx, keys: &[String]) -> Result<(), OutboxError>;

    /// Row counts per status.
    async fn status_counts(&self, tx: &mut Self::Tx) -> Result<StatusCounts, OutboxError>;
}

#[async_trait]
impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    type Tx = S::Tx;

    async fn enqueue(
        &self,
        tx: &mut Self::Tx,
        idempotency_key: &str,
        kind: OutboxKind,
        payload: &[u8],
    ) -> Result<(), OutboxError> {
        (**self).enqueue(tx, idempotency_key, kind, payload).await
    }

    async fn claim_batch(
        &self,
        tx: &mut Self::Tx,
        max_count: usize,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        (**self).claim_batch(tx, max_count, lease_ttl).await
    }

    async fn mark_complete(&self, tx: &mut Self::Tx, keys: &[String]) -> Result<(), OutboxError> {
        (**self).mark_complete(tx, keys).await
    }

    async fn status_counts(&self, tx: &mut Self::Tx) -> Result<StatusCounts, OutboxError> {
        (**self).status_counts(tx).await
    }
}

/// Outbox store error.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error(transparent)]
    Transaction(#[from] TxError),

    #[error("outbox storage error: {0}")]
    Storage(String),

    #[error("database error in {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl OutboxError {
    pub(crate) fn database(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Database { operation, source }
    }
}

/// Outbox row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub created: u64,
    pub in_progress: u64,
    pub success: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: OutboxStatus, n: u64) {
        match status {
            OutboxStatus::Created => self.created += n,
            OutboxStatus::InProgress => self.in_progress += n,
            OutboxStatus::Success => self.success += n,
        }
    }

    /// Rows not yet delivered.
    pub fn pending(&self) -> u64 {
        self.created + self.in_progress
    }

    pub fn total(&self) -> u64 {
        self.pending() + self.success
    }
}
