//! In-memory transactional database (tests/dev).
//!
//! Committed tables live behind a short-lived mutex that is never held across
//! an `.await`. A transaction reads a snapshot taken at `begin` and records
//! which rows it writes; commit merges exactly those rows back into the
//! committed tables, dropping the handle discards them.
//!
//! Outbox claims emulate row-level `FOR UPDATE SKIP LOCKED`: a transaction
//! that claims a row registers its key in a shared claim set, other
//! transactions skip claimed keys, and the key is released when the claiming
//! transaction commits or is dropped. Claiming is therefore the only point
//! where transactions wait on each other, and only for the duration of the
//! claim itself.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use library_catalog::{Author, Book};
use library_core::{AuthorId, BookId};

use super::clock::{Clock, SystemClock};
use super::{Transactor, TxError};
use crate::outbox::{OutboxRecord, OutboxStatus};

/// Every table of the in-memory backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    /// Outbox rows in insertion order.
    pub outbox: Vec<OutboxRecord>,
    pub authors: HashMap<AuthorId, Author>,
    pub books: HashMap<BookId, Book>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: MemoryTables,
    /// Outbox key → id of the open transaction holding its claim.
    claims: HashMap<String, u64>,
}

/// Critical sections never leave `Shared` half-updated, so a poisoned lock
/// still guards consistent data.
fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to the in-memory database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InMemoryDatabase {
    shared: Arc<Mutex<Shared>>,
    next_tx: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    fail_next_begin: Arc<AtomicBool>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            next_tx: Arc::new(AtomicU64::new(1)),
            clock,
            fail_next_begin: Arc::new(AtomicBool::new(false)),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Committed state, as any new transaction would see it.
    pub async fn snapshot(&self) -> MemoryTables {
        lock(&self.shared).tables.clone()
    }

    /// Make the next `begin` fail (fault injection for tests).
    pub fn fail_next_begin(&self) {
        self.fail_next_begin.store(true, Ordering::SeqCst);
    }

    /// Make the next `commit` fail and discard its writes (fault injection for tests).
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Rows a transaction has written, merged into the committed tables on commit.
#[derive(Debug, Default)]
struct WriteSet {
    authors: HashSet<AuthorId>,
    books: HashSet<BookId>,
    /// Outbox keys inserted by this transaction, in insertion order.
    inserted: Vec<String>,
    /// Outbox keys whose status this transaction changed.
    updated: HashSet<String>,
}

/// An open in-memory transaction.
pub struct MemoryTx {
    id: u64,
    shared: Arc<Mutex<Shared>>,
    staged: MemoryTables,
    writes: WriteSet,
    claimed: HashSet<String>,
    clock: Arc<dyn Clock>,
}

impl MemoryTx {
    /// The transaction's view: its snapshot plus its own writes.
    pub fn tables(&self) -> &MemoryTables {
        &self.staged
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn put_author(&mut self, author: Author) {
        self.writes.authors.insert(author.id);
        self.staged.authors.insert(author.id, author);
    }

    pub fn put_book(&mut self, book: Book) {
        self.writes.books.insert(book.id);
        self.staged.books.insert(book.id, book);
    }

    /// Stage a new outbox row. Returns `false` (and stages nothing) when the
    /// key is already visible. A key committed concurrently by another
    /// transaction is resolved on commit, where the committed row wins.
    pub fn insert_outbox(&mut self, record: OutboxRecord) -> bool {
        let key = &record.idempotency_key;
        if self.staged.outbox.iter().any(|r| &r.idempotency_key == key) {
            return false;
        }
        self.writes.inserted.push(key.clone());
        self.staged.outbox.push(record);
        true
    }

    /// Replace the outbox view with the latest committed rows, keeping this
    /// transaction's own writes.
    pub fn refresh_outbox(&mut self) {
        let shared = Arc::clone(&self.shared);
        let shared = lock(&shared);
        self.refresh_outbox_from(&shared.tables);
    }

    fn refresh_outbox_from(&mut self, committed: &MemoryTables) {
        let writes = &self.writes;
        let mut own: HashMap<String, OutboxRecord> = self
            .staged
            .outbox
            .drain(..)
            .filter(|r| {
                writes.updated.contains(&r.idempotency_key)
                    || writes.inserted.contains(&r.idempotency_key)
            })
            .map(|r| (r.idempotency_key.clone(), r))
            .collect();

        let mut rows = Vec::with_capacity(committed.outbox.len() + own.len());
        for row in &committed.outbox {
            let key = &row.idempotency_key;
            match own.remove(key) {
                Some(mine) if writes.updated.contains(key) => rows.push(mine),
                _ => rows.push(row.clone()),
            }
        }
        for key in &writes.inserted {
            if let Some(mine) = own.remove(key) {
                rows.push(mine);
            }
        }
        self.staged.outbox = rows;
    }

    /// Refresh the outbox view and claim the rows `pick` selects among those
    /// not claimed by another open transaction. Returns the claimed keys.
    ///
    /// Refresh, selection and registration happen under one lock, so two
    /// transactions can never claim the same key.
    pub fn claim_outbox_rows<F>(&mut self, pick: F) -> Vec<String>
    where
        F: FnOnce(&[&OutboxRecord]) -> Vec<String>,
    {
        let shared = Arc::clone(&self.shared);
        let mut shared = lock(&shared);
        self.refresh_outbox_from(&shared.tables);

        let keys = {
            let candidates: Vec<&OutboxRecord> = self
                .staged
                .outbox
                .iter()
                .filter(|r| {
                    shared
                        .claims
                        .get(&r.idempotency_key)
                        .is_none_or(|owner| *owner == self.id)
                })
                .collect();
            pick(&candidates)
        };

        for key in &keys {
            shared.claims.insert(key.clone(), self.id);
            self.claimed.insert(key.clone());
        }
        keys
    }

    /// Apply `change` to the visible outbox row `key`. `change` returns whether
    /// it modified the row; only modified rows are written back on commit.
    pub fn update_outbox<F>(&mut self, key: &str, change: F) -> Option<&OutboxRecord>
    where
        F: FnOnce(&mut OutboxRecord) -> bool,
    {
        let row = self
            .staged
            .outbox
            .iter_mut()
            .find(|r| r.idempotency_key == key)?;
        if change(row) {
            self.writes.updated.insert(key.to_string());
        }
        Some(row)
    }

    fn apply(&mut self, shared: &mut Shared) {
        let tables = &mut shared.tables;
        for id in self.writes.authors.drain() {
            if let Some(author) = self.staged.authors.get(&id) {
                tables.authors.insert(id, author.clone());
            }
        }
        for id in self.writes.books.drain() {
            if let Some(book) = self.staged.books.get(&id) {
                tables.books.insert(id, book.clone());
            }
        }

        for key in self.writes.inserted.drain(..) {
            if tables.outbox.iter().any(|r| r.idempotency_key == key) {
                debug!(idempotency_key = %key, "outbox key committed concurrently, insert dropped");
                continue;
            }
            if let Some(row) = self.staged.outbox.iter().find(|r| r.idempotency_key == key) {
                tables.outbox.push(row.clone());
            }
        }
        for key in self.writes.updated.drain() {
            let Some(row) = self.staged.outbox.iter().find(|r| r.idempotency_key == key) else {
                continue;
            };
            if let Some(target) = tables.outbox.iter_mut().find(|r| r.idempotency_key == key) {
                // SUCCESS is terminal.
                if target.status != OutboxStatus::Success {
                    target.status = row.status;
                    target.updated_at = row.updated_at;
                }
            }
        }

        self.release_claims(&mut shared.claims);
    }

    fn release_claims(&mut self, claims: &mut HashMap<String, u64>) {
        for key in self.claimed.drain() {
            if claims.get(&key) == Some(&self.id) {
                claims.remove(&key);
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if self.claimed.is_empty() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let mut shared = lock(&shared);
        self.release_claims(&mut shared.claims);
    }
}

impl std::fmt::Debug for MemoryTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTx")
            .field("id", &self.id)
            .field("outbox_rows", &self.staged.outbox.len())
            .field("authors", &self.staged.authors.len())
            .field("books", &self.staged.books.len())
            .field("claimed", &self.claimed.len())
            .finish()
    }
}

#[async_trait]
impl Transactor for InMemoryDatabase {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, TxError> {
        if self.fail_next_begin.swap(false, Ordering::SeqCst) {
            return Err(TxError::Begin("injected begin failure".to_string()));
        }
        let staged = lock(&self.shared).tables.clone();
        Ok(MemoryTx {
            id: self.next_tx.fetch_add(1, Ordering::Relaxed),
            shared: self.shared.clone(),
            staged,
            writes: WriteSet::default(),
            claimed: HashSet::new(),
            clock: self.clock.clone(),
        })
    }

    async fn commit(&self, mut tx: MemoryTx) -> Result<(), TxError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            debug!("discarding staged writes after injected commit failure");
            return Err(TxError::Commit("injected commit failure".to_string()));
        }
        {
            let mut shared = lock(&self.shared);
            tx.apply(&mut shared);
        }
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), TxError> {
        drop(tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxKind;
    use std::time::Duration;

    fn row(key: &str, now: DateTime<Utc>) -> OutboxRecord {
        OutboxRecord::created(key, OutboxKind::Book, Vec::new(), now)
    }

    fn claim_all(tx: &mut MemoryTx) -> Vec<String> {
        tx.claim_outbox_rows(|rows| {
            rows.iter()
                .filter(|r| r.status == OutboxStatus::Created)
                .map(|r| r.idempotency_key.clone())
                .collect()
        })
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.put_author(Author::new("Anna").unwrap());
        drop(tx);

        assert!(db.snapshot().await.authors.is_empty());
    }

    #[tokio::test]
    async fn open_transactions_do_not_block_each_other() {
        let db = InMemoryDatabase::new();
        let mut first = db.begin().await.unwrap();
        first.put_author(Author::new("Anna").unwrap());

        let mut second = tokio::time::timeout(Duration::from_millis(50), db.begin())
            .await
            .unwrap()
            .unwrap();
        second.put_author(Author::new("Boris").unwrap());

        db.commit(second).await.unwrap();
        db.commit(first).await.unwrap();
        assert_eq!(db.snapshot().await.authors.len(), 2);
    }

    #[tokio::test]
    async fn claimed_rows_are_skipped_until_released() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let now = tx.now();
        tx.insert_outbox(row("book_1", now));
        db.commit(tx).await.unwrap();

        let mut holder = db.begin().await.unwrap();
        assert_eq!(claim_all(&mut holder), ["book_1"]);

        let mut other = db.begin().await.unwrap();
        assert!(claim_all(&mut other).is_empty());
        drop(other);

        drop(holder);
        let mut next = db.begin().await.unwrap();
        assert_eq!(claim_all(&mut next), ["book_1"]);
    }

    #[tokio::test]
    async fn commit_releases_claims_and_publishes_status() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let now = tx.now();
        tx.insert_outbox(row("book_1", now));
        db.commit(tx).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        claim_all(&mut tx);
        tx.update_outbox("book_1", |r| {
            r.status = OutboxStatus::InProgress;
            true
        });
        db.commit(tx).await.unwrap();

        assert_eq!(db.snapshot().await.outbox[0].status, OutboxStatus::InProgress);
        let mut tx = db.begin().await.unwrap();
        let keys = tx.claim_outbox_rows(|rows| rows.iter().map(|r| r.idempotency_key.clone()).collect());
        assert_eq!(keys, ["book_1"]);
    }

    #[tokio::test]
    async fn concurrent_insert_of_same_key_keeps_first_commit() {
        let db = InMemoryDatabase::new();
        let mut first = db.begin().await.unwrap();
        let mut second = db.begin().await.unwrap();
        let now = first.now();

        let mut original = row("book_1", now);
        original.payload = b"first".to_vec();
        assert!(first.insert_outbox(original));
        let mut late = row("book_1", now);
        late.payload = b"second".to_vec();
        assert!(second.insert_outbox(late));

        db.commit(first).await.unwrap();
        db.commit(second).await.unwrap();

        let rows = db.snapshot().await.outbox;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, b"first");
    }
}
