//! Database adapters: transaction backends and the unit of work.
//!
//! ## Explicit transaction handles
//!
//! There is no ambient "current transaction". A [`Transactor`] hands out a
//! transaction handle (`Transactor::Tx`) and every store/repository call takes
//! `&mut Tx` explicitly. Whether a piece of work opens its own transaction or
//! joins the caller's is decided once, when the [`UnitOfWork`] is constructed.
//!
//! ## Rollback on drop
//!
//! Both backends roll back a transaction whose handle is dropped without a
//! commit. An early return, a `?`, or a panic inside the work therefore never
//! publishes partial writes.

pub mod clock;
pub mod memory;
pub mod postgres;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::{InMemoryDatabase, MemoryTables, MemoryTx};
pub use postgres::{PgTransactor, PgTx, connect, run_migrations};

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Transaction lifecycle failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("failed to begin transaction: {0}")]
    Begin(String),

    #[error("failed to commit transaction: {0}")]
    Commit(String),

    #[error("failed to roll back transaction: {0}")]
    Rollback(String),
}

/// Opens, commits and rolls back transactions on one backend.
#[async_trait]
pub trait Transactor: Send + Sync {
    /// Backend transaction handle. Dropping it uncommitted rolls back.
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, TxError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), TxError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), TxError>;
}

enum Scope<'a, Tx> {
    Owned(Tx),
    Joined(&'a mut Tx),
}

/// One atomic unit of work.
///
/// Either owns a freshly opened transaction or joins a transaction owned by an
/// outer unit of work. A joined unit has no commit/rollback of its own: both are
/// no-ops and the outer owner decides the outcome.
pub struct UnitOfWork<'a, T: Transactor> {
    transactor: &'a T,
    scope: Scope<'a, T::Tx>,
}

impl<'a, T: Transactor> UnitOfWork<'a, T> {
    /// Open a new transaction.
    pub async fn begin(transactor: &'a T) -> Result<Self, TxError> {
        let tx = transactor.begin().await?;
        Ok(Self {
            transactor,
            scope: Scope::Owned(tx),
        })
    }

    /// Participate in a transaction owned by the caller.
    pub fn join(transactor: &'a T, tx: &'a mut T::Tx) -> Self {
        Self {
            transactor,
            scope: Scope::Joined(tx),
        }
    }

    /// Reuse `existing` when present, otherwise open a new transaction.
    pub async fn join_or_begin(
        transactor: &'a T,
        existing: Option<&'a mut T::Tx>,
    ) -> Result<Self, TxError> {
        match existing {
            Some(tx) => Ok(Self::join(transactor, tx)),
            None => Self::begin(transactor).await,
        }
    }

    /// `true` when this unit participates in an outer transaction.
    pub fn is_joined(&self) -> bool {
        matches!(self.scope, Scope::Joined(_))
    }

    /// The transaction handle every store call inside this unit must use.
    pub fn tx(&mut self) -> &mut T::Tx {
        match &mut self.scope {
            Scope::Owned(tx) => tx,
            Scope::Joined(tx) => &mut **tx,
        }
    }

    pub async fn commit(self) -> Result<(), TxError> {
        match self.scope {
            Scope::Owned(tx) => self.transactor.commit(tx).await,
            Scope::Joined(_) => Ok(()),
        }
    }

    pub async fn rollback(self) -> Result<(), TxError> {
        match self.scope {
            Scope::Owned(tx) => self.transactor.rollback(tx).await,
            Scope::Joined(_) => Ok(()),
        }
    }
}

/// Boxed future returned by the work passed to [`with_transaction`].
pub type TxFuture<'t, R, E> = Pin<Box<dyn Future<Output = Result<R, E>> + Send + 't>>;

/// Run `work` atomically.
///
/// - `existing = Some(tx)`: `work` runs on the caller's transaction; nothing is
///   committed or rolled back here.
/// - `existing = None`: a transaction is opened (a begin failure is returned
///   without calling `work`), committed when `work` succeeds and rolled back
///   when it fails.
///
/// A commit failure is returned as the call's error. When `work` fails, its
/// error wins over a rollback failure (which is only logged).
///
/// Closures capture owned values (`Arc` clones, owned strings) so the returned
/// future only borrows the transaction:
///
/// ```ignore
/// let store = store.clone();
/// with_transaction(&transactor, None, move |tx| {
///     Box::pin(async move {
///         store.enqueue(tx, "book_42", OutboxKind::Book, b"{}").await?;
///         Ok::<_, OutboxError>(())
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<T, R, E, F>(
    transactor: &T,
    existing: Option<&mut T::Tx>,
    work: F,
) -> Result<R, E>
where
    T: Transactor,
    E: From<TxError>,
    F: for<'t> FnOnce(&'t mut T::Tx) -> TxFuture<'t, R, E>,
{
    let mut uow = UnitOfWork::join_or_begin(transactor, existing).await?;

    match work(uow.tx()).await {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %rollback_err, "rollback after failed unit of work also failed");
            }
            Err(err)
        }
    }
}
