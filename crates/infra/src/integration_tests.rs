//! Integration tests for the full outbox pipeline.
//!
//! Tests: use case → (entity + outbox row, one transaction) → dispatcher → handler
//!
//! Verifies:
//! - Enqueue is idempotent and atomic with the business write
//! - Delivered messages are never claimed again
//! - Failed and unroutable messages come back only after their lease expires
//! - Concurrent workers never deliver the same message twice in one lease
//! - A slow delivery never stalls catalog writes

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use library_catalog::{Author, Book, outbox_key};
    use library_core::AuthorId;

    use crate::catalog::{CatalogError, CatalogRepository, InMemoryCatalogRepository};
    use crate::db::{InMemoryDatabase, ManualClock, Transactor, with_transaction};
    use crate::library::{CatalogService, Library};
    use crate::outbox::{
        ChannelSink, DeliveryError, DeliveryStats, DeliveryStatus, DispatcherConfig, Fanout,
        InMemoryOutboxStore, KindRegistry, OutboxDispatcher, OutboxError, OutboxKind,
        OutboxStatus, OutboxStore,
    };

    const LEASE: Duration = Duration::from_secs(30);

    type Dispatcher = OutboxDispatcher<InMemoryDatabase, InMemoryOutboxStore>;

    fn setup() -> (InMemoryDatabase, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (InMemoryDatabase::with_clock(clock.clone()), clock)
    }

    fn dispatcher(db: &InMemoryDatabase, registry: KindRegistry, batch_size: usize) -> Dispatcher {
        OutboxDispatcher::new(
            Arc::new(db.clone()),
            Arc::new(InMemoryOutboxStore::new()),
            Arc::new(registry),
            DispatcherConfig::default()
                .with_batch_size(batch_size)
                .with_lease_ttl(LEASE)
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    async fn enqueue(db: &InMemoryDatabase, key: &str, kind: OutboxKind) {
        let key = key.to_string();
        with_transaction(db, None, move |tx| {
            Box::pin(async move {
                InMemoryOutboxStore::new().enqueue(tx, &key, kind, b"{}").await?;
                Ok::<_, OutboxError>(())
            })
        })
        .await
        .unwrap();
    }

    async fn status_of(db: &InMemoryDatabase, key: &str) -> Option<OutboxStatus> {
        db.snapshot()
            .await
            .outbox
            .iter()
            .find(|r| r.idempotency_key == key)
            .map(|r| r.status)
    }

    /// `book` and `author` handlers that log every payload they see.
    fn recording_registry(log: Arc<Mutex<Vec<String>>>, fail_authors: bool) -> KindRegistry {
        let mut registry = KindRegistry::new();
        let books = log.clone();
        registry.register_fn(OutboxKind::Book, move |payload| {
            let books = books.clone();
            async move {
                books.lock().unwrap().push(String::from_utf8_lossy(&payload).into_owned());
                Ok(())
            }
        });
        registry.register_fn(OutboxKind::Author, move |payload| {
            let authors = log.clone();
            async move {
                authors.lock().unwrap().push(String::from_utf8_lossy(&payload).into_owned());
                if fail_authors {
                    Err(DeliveryError::Rejected { status: 500 })
                } else {
                    Ok(())
                }
            }
        });
        registry
    }

    #[tokio::test]
    async fn idempotent_enqueue_stores_one_row() {
        let (db, _) = setup();
        enqueue(&db, "book_42", OutboxKind::Book).await;
        enqueue(&db, "book_42", OutboxKind::Book).await;

        assert_eq!(db.snapshot().await.outbox.len(), 1);
    }

    #[tokio::test]
    async fn delivered_message_is_never_claimed_again() {
        let (db, clock) = setup();
        enqueue(&db, "book_42", OutboxKind::Book).await;

        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(&db, recording_registry(log.clone(), false), 10);

        let report = dispatcher.run_cycle().await.unwrap();
        assert_eq!((report.claimed, report.delivered), (1, 1));
        assert_eq!(status_of(&db, "book_42").await, Some(OutboxStatus::Success));

        clock.advance(LEASE * 10);
        let report = dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_waits_for_lease_expiry() {
        let (db, clock) = setup();
        enqueue(&db, "author_7", OutboxKind::Author).await;

        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(&db, recording_registry(log.clone(), true), 10);

        let report = dispatcher.run_cycle().await.unwrap();
        assert_eq!((report.claimed, report.delivered), (1, 0));
        assert_eq!(status_of(&db, "author_7").await, Some(OutboxStatus::InProgress));

        clock.advance(LEASE / 2);
        assert_eq!(dispatcher.run_cycle().await.unwrap().claimed, 0);

        clock.advance(LEASE);
        let report = dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unroutable_kind_stays_in_progress_until_lease_expiry() {
        let (db, clock) = setup();
        enqueue(&db, "mystery_1", OutboxKind::Undefined).await;

        let stats = Arc::new(DeliveryStats::new());
        let (channel, mut outcomes) = ChannelSink::new();
        let dispatcher = dispatcher(&db, recording_registry(Arc::default(), false), 10)
            .with_sink(Arc::new(Fanout::new().with(stats.clone()).with(Arc::new(channel))));

        assert_eq!(dispatcher.run_cycle().await.unwrap().delivered, 0);
        assert_eq!(status_of(&db, "mystery_1").await, Some(OutboxStatus::InProgress));
        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(outcome.status, DeliveryStatus::UnknownKind(_)));

        assert_eq!(dispatcher.run_cycle().await.unwrap().claimed, 0);

        clock.advance(LEASE + Duration::from_millis(1));
        assert_eq!(dispatcher.run_cycle().await.unwrap().claimed, 1);
        assert_eq!(status_of(&db, "mystery_1").await, Some(OutboxStatus::InProgress));
        assert_eq!(stats.get(OutboxKind::Undefined).unknown_kind, 2);
    }

    #[tokio::test]
    async fn failed_business_write_discards_outbox_row() {
        let (db, _) = setup();
        let repository = Arc::new(InMemoryCatalogRepository::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());

        let author = Author::new("Anna").unwrap();
        let key = outbox_key(&author);
        let result = with_transaction(&db, None, move |tx| {
            Box::pin(async move {
                repository.insert_author(tx, &author).await?;
                outbox.enqueue(tx, &key, OutboxKind::Author, b"{}").await?;
                // A book by an unknown author fails after the enqueue.
                let book = Book::new("Orphan", vec![AuthorId::new()])?;
                repository.insert_book(tx, &book).await?;
                Ok::<_, CatalogError>(())
            })
        })
        .await;

        assert!(matches!(result, Err(CatalogError::AuthorNotFound(_))));
        let tables = db.snapshot().await;
        assert!(tables.authors.is_empty());
        assert!(tables.outbox.is_empty());
    }

    #[tokio::test]
    async fn use_cases_feed_the_dispatcher() {
        let (db, _) = setup();
        let library = Library::new(
            Arc::new(db.clone()),
            Arc::new(InMemoryCatalogRepository::new()),
            Arc::new(InMemoryOutboxStore::new()),
        );
        let author = library.register_author("Anna").await.unwrap();
        let book = library.add_book("Requiem", vec![author.id]).await.unwrap();

        let delivered: Arc<Mutex<Vec<(OutboxKind, String)>>> = Arc::default();
        let mut registry = KindRegistry::new();
        let sink = delivered.clone();
        registry.register_fn(OutboxKind::Book, move |payload| {
            let sink = sink.clone();
            async move {
                let book: Book = serde_json::from_slice(&payload)
                    .map_err(|e| DeliveryError::Payload(e.to_string()))?;
                sink.lock().unwrap().push((OutboxKind::Book, book.id.to_string()));
                Ok(())
            }
        });
        let sink = delivered.clone();
        registry.register_fn(OutboxKind::Author, move |payload| {
            let sink = sink.clone();
            async move {
                let author: Author = serde_json::from_slice(&payload)
                    .map_err(|e| DeliveryError::Payload(e.to_string()))?;
                sink.lock().unwrap().push((OutboxKind::Author, author.id.to_string()));
                Ok(())
            }
        });

        let report = dispatcher(&db, registry, 10).run_cycle().await.unwrap();
        assert_eq!(report.delivered, 2);

        let delivered = delivered.lock().unwrap().clone();
        assert_eq!(
            delivered,
            vec![
                (OutboxKind::Author, author.id.to_string()),
                (OutboxKind::Book, book.id.to_string()),
            ]
        );
        assert_eq!(library.outbox_counts().await.unwrap().success, 2);
    }

    #[tokio::test]
    async fn concurrent_claimers_partition_the_queue() {
        let (db, _) = setup();
        for i in 0..60 {
            enqueue(&db, &format!("book_{i}"), OutboxKind::Book).await;
        }

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move {
                let store = InMemoryOutboxStore::new();
                let mut tx = db.begin().await.unwrap();
                let claimed = store.claim_batch(&mut tx, 15, LEASE).await.unwrap();
                db.commit(tx).await.unwrap();
                claimed.into_iter().map(|m| m.idempotency_key).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for key in task.await.unwrap() {
                assert!(seen.insert(key.clone()), "{key} claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 60);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_pool_delivers_every_message_once() {
        let db = InMemoryDatabase::new();
        for i in 0..200 {
            enqueue(&db, &format!("book_{i}"), OutboxKind::Book).await;
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = KindRegistry::new();
        let counter = calls.clone();
        registry.register_fn(OutboxKind::Book, move |_| {
            let counter = counter.clone();
            async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (channel, mut outcomes) = ChannelSink::new();
        let handle = dispatcher(&db, registry, 7)
            .with_sink(Arc::new(channel))
            .start();

        let mut delivered_keys = HashMap::<String, usize>::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while delivered_keys.len() < 200 {
                let outcome = outcomes.recv().await.unwrap();
                assert!(outcome.is_delivered());
                *delivered_keys.entry(outcome.idempotency_key).or_default() += 1;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await;

        assert!(delivered_keys.values().all(|&n| n == 1));
        assert_eq!(calls.load(Ordering::SeqCst), 200);
        let tables = db.snapshot().await;
        assert!(tables.outbox.iter().all(|r| r.status == OutboxStatus::Success));
    }

    #[tokio::test]
    async fn catalog_writes_proceed_while_a_delivery_is_slow() {
        let db = InMemoryDatabase::new();
        enqueue(&db, "book_1", OutboxKind::Book).await;

        let mut registry = KindRegistry::new();
        registry.register_fn(OutboxKind::Book, |_| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        });
        let handle = OutboxDispatcher::new(
            Arc::new(db.clone()),
            Arc::new(InMemoryOutboxStore::new()),
            Arc::new(registry),
            DispatcherConfig::default()
                .with_workers(1)
                .with_lease_ttl(LEASE)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .start();

        // Let the worker claim and enter the handler.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let library = Library::new(
            Arc::new(db.clone()),
            Arc::new(InMemoryCatalogRepository::new()),
            Arc::new(InMemoryOutboxStore::new()),
        );
        let author = tokio::time::timeout(Duration::from_millis(500), library.register_author("Anna"))
            .await
            .expect("registration must not wait for the delivery")
            .unwrap();
        let counts = tokio::time::timeout(Duration::from_millis(500), library.outbox_counts())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counts.total(), 2);
        assert!(db.snapshot().await.authors.contains_key(&author.id));

        handle.shutdown().await;
        assert_eq!(status_of(&db, "book_1").await, Some(OutboxStatus::Success));
    }
}
