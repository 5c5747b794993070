//! Postgres transaction backend, pool setup and schema migrations.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, instrument};

use super::{Transactor, TxError};

/// A Postgres transaction. Dropping it uncommitted rolls back.
pub type PgTx = Transaction<'static, Postgres>;

const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_outbox", include_str!("../../migrations/0001_outbox.sql")),
    ("0002_catalog", include_str!("../../migrations/0002_catalog.sql")),
];

/// [`Transactor`] over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgTransactor {
    pool: PgPool,
}

impl PgTransactor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Transactor for PgTransactor {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, TxError> {
        self.pool
            .begin()
            .await
            .map_err(|e| TxError::Begin(e.to_string()))
    }

    async fn commit(&self, tx: PgTx) -> Result<(), TxError> {
        tx.commit().await.map_err(|e| TxError::Commit(e.to_string()))
    }

    async fn rollback(&self, tx: PgTx) -> Result<(), TxError> {
        tx.rollback()
            .await
            .map_err(|e| TxError::Rollback(e.to_string()))
    }
}

/// Open a connection pool.
#[instrument(skip(database_url), err)]
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Apply the bundled schema. Every script is idempotent, so this runs on each startup.
#[instrument(skip(pool), err)]
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for (name, sql) in MIGRATIONS {
        sqlx::raw_sql(sql).execute(pool).await?;
        info!(migration = name, "migration applied");
    }
    Ok(())
}
