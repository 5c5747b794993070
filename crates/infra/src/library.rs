//! Catalog use cases.
//!
//! Creating an author or a book writes the entity and enqueues its outbox
//! message in one transaction. Renames and book updates do not enqueue: the
//! outbox key of an entity is fixed, so a second message would be dropped as
//! a duplicate anyway.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use library_catalog::{Author, Book, outbox_key};
use library_core::{AuthorId, BookId};

use crate::catalog::{CatalogError, CatalogRepository};
use crate::db::{Transactor, with_transaction};
use crate::outbox::{OutboxKind, OutboxStore, StatusCounts};

/// The catalog operations exposed to transports.
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn register_author(&self, name: &str) -> Result<Author, CatalogError>;

    async fn change_author_name(&self, id: AuthorId, name: &str) -> Result<Author, CatalogError>;

    async fn get_author(&self, id: AuthorId) -> Result<Author, CatalogError>;

    async fn get_author_books(&self, id: AuthorId) -> Result<Vec<Book>, CatalogError>;

    async fn add_book(&self, name: &str, author_ids: Vec<AuthorId>) -> Result<Book, CatalogError>;

    async fn update_book(
        &self,
        id: BookId,
        name: &str,
        author_ids: Vec<AuthorId>,
    ) -> Result<Book, CatalogError>;

    async fn get_book(&self, id: BookId) -> Result<Book, CatalogError>;

    async fn outbox_counts(&self) -> Result<StatusCounts, CatalogError>;
}

/// [`CatalogService`] over one transaction backend.
pub struct Library<T, R, S> {
    transactor: Arc<T>,
    repository: Arc<R>,
    outbox: Arc<S>,
}

impl<T, R, S> Clone for Library<T, R, S> {
    fn clone(&self) -> Self {
        Self {
            transactor: self.transactor.clone(),
            repository: self.repository.clone(),
            outbox: self.outbox.clone(),
        }
    }
}

fn encode<E: serde::Serialize>(entity: &E) -> Result<Vec<u8>, CatalogError> {
    serde_json::to_vec(entity)
        .map_err(|e| CatalogError::Storage(format!("failed to encode outbox payload: {e}")))
}

impl<T, R, S> Library<T, R, S>
where
    T: Transactor + 'static,
    R: CatalogRepository<Tx = T::Tx> + 'static,
    S: OutboxStore<Tx = T::Tx> + 'static,
{
    pub fn new(transactor: Arc<T>, repository: Arc<R>, outbox: Arc<S>) -> Self {
        Self {
            transactor,
            repository,
            outbox,
        }
    }

    /// Register an author, joining `existing` when given.
    pub async fn register_author_within(
        &self,
        existing: Option<&mut T::Tx>,
        name: &str,
    ) -> Result<Author, CatalogError> {
        let author = Author::new(name)?;
        let key = outbox_key(&author);
        let payload = encode(&author)?;

        let repository = self.repository.clone();
        let outbox = self.outbox.clone();
        let record = author.clone();
        with_transaction(self.transactor.as_ref(), existing, move |tx| {
            Box::pin(async move {
                repository.insert_author(tx, &record).await?;
                outbox.enqueue(tx, &key, OutboxKind::Author, &payload).await?;
                Ok::<_, CatalogError>(())
            })
        })
        .await?;

        info!(author_id = %author.id, "author registered");
        Ok(author)
    }

    /// Add a book, joining `existing` when given.
    pub async fn add_book_within(
        &self,
        existing: Option<&mut T::Tx>,
        name: &str,
        author_ids: Vec<AuthorId>,
    ) -> Result<Book, CatalogError> {
        let book = Book::new(name, author_ids)?;
        let key = outbox_key(&book);
        let payload = encode(&book)?;

        let repository = self.repository.clone();
        let outbox = self.outbox.clone();
        let record = book.clone();
        with_transaction(self.transactor.as_ref(), existing, move |tx| {
            Box::pin(async move {
                repository.insert_book(tx, &record).await?;
                outbox.enqueue(tx, &key, OutboxKind::Book, &payload).await?;
                Ok::<_, CatalogError>(())
            })
        })
        .await?;

        info!(book_id = %book.id, authors = book.author_ids.len(), "book added");
        Ok(book)
    }
}

#[async_trait]
impl<T, R, S> CatalogService for Library<T, R, S>
where
    T: Transactor + 'static,
    R: CatalogRepository<Tx = T::Tx> + 'static,
    S: OutboxStore<Tx = T::Tx> + 'static,
{
    async fn register_author(&self, name: &str) -> Result<Author, CatalogError> {
        self.register_author_within(None, name).await
    }

    async fn change_author_name(&self, id: AuthorId, name: &str) -> Result<Author, CatalogError> {
        let repository = self.repository.clone();
        let name = name.to_string();
        with_transaction(self.transactor.as_ref(), None, move |tx| {
            Box::pin(async move {
                let mut author = repository.get_author(tx, id).await?;
                author.rename(&name)?;
                repository.update_author(tx, &author).await?;
                Ok::<_, CatalogError>(author)
            })
        })
        .await
    }

    async fn get_author(&self, id: AuthorId) -> Result<Author, CatalogError> {
        let repository = self.repository.clone();
        with_transaction(self.transactor.as_ref(), None, move |tx| {
            Box::pin(async move { repository.get_author(tx, id).await })
        })
        .await
    }

    async fn get_author_books(&self, id: AuthorId) -> Result<Vec<Book>, CatalogError> {
        let repository = self.repository.clone();
        with_transaction(self.transactor.as_ref(), None, move |tx| {
            Box::pin(async move {
                repository.get_author(tx, id).await?;
                repository.books_by_author(tx, id).await
            })
        })
        .await
    }

    async fn add_book(&self, name: &str, author_ids: Vec<AuthorId>) -> Result<Book, CatalogError> {
        self.add_book_within(None, name, author_ids).await
    }

    async fn update_book(
        &self,
        id: BookId,
        name: &str,
        author_ids: Vec<AuthorId>,
    ) -> Result<Book, CatalogError> {
        let repository = self.repository.clone();
        let name = name.to_string();
        with_transaction(self.transactor.as_ref(), None, move |tx| {
            Box::pin(async move {
                let mut book = repository.get_book(tx, id).await?;
                book.update(&name, author_ids)?;
                repository.update_book(tx, &book).await?;
                Ok::<_, CatalogError>(book)
            })
        })
        .await
    }

    async fn get_book(&self, id: BookId) -> Result<Book, CatalogError> {
        let repository = self.repository.clone();
        with_transaction(self.transactor.as_ref(), None, move |tx| {
            Box::pin(async move { repository.get_book(tx, id).await })
        })
        .await
    }

    async fn outbox_counts(&self) -> Result<StatusCounts, CatalogError> {
        let outbox = self.outbox.clone();
        with_transaction(self.transactor.as_ref(), None, move |tx| {
            Box::pin(async move { Ok::<_, CatalogError>(outbox.status_counts(tx).await?) })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalogRepository;
    use crate::db::{InMemoryDatabase, UnitOfWork};
    use crate::outbox::InMemoryOutboxStore;

    type MemLibrary = Library<InMemoryDatabase, InMemoryCatalogRepository, InMemoryOutboxStore>;

    fn library(db: &InMemoryDatabase) -> MemLibrary {
        Library::new(
            Arc::new(db.clone()),
            Arc::new(InMemoryCatalogRepository::new()),
            Arc::new(InMemoryOutboxStore::new()),
        )
    }

    #[tokio::test]
    async fn registering_an_author_enqueues_its_message() {
        let db = InMemoryDatabase::new();
        let library = library(&db);

        let author = library.register_author("Anna Akhmatova").await.unwrap();

        let tables = db.snapshot().await;
        assert_eq!(tables.authors.get(&author.id), Some(&author));
        assert_eq!(tables.outbox.len(), 1);
        let row = &tables.outbox[0];
        assert_eq!(row.idempotency_key, format!("author_{}", author.id));
        assert_eq!(row.kind, OutboxKind::Author);
        let decoded: Author = serde_json::from_slice(&row.payload).unwrap();
        assert_eq!(decoded, author);
    }

    #[tokio::test]
    async fn invalid_input_writes_nothing() {
        let db = InMemoryDatabase::new();
        let library = library(&db);

        let err = library.register_author("   ").await.unwrap_err();
        assert!(matches!(err, CatalogError::Domain(_)));

        let err = library.add_book("Lost", vec![AuthorId::new()]).await.unwrap_err();
        assert!(matches!(err, CatalogError::AuthorNotFound(_)));

        let tables = db.snapshot().await;
        assert!(tables.books.is_empty());
        assert!(tables.outbox.is_empty());
    }

    #[tokio::test]
    async fn failed_commit_drops_entity_and_message() {
        let db = InMemoryDatabase::new();
        let library = library(&db);
        db.fail_next_commit();

        let err = library.register_author("Anna").await.unwrap_err();
        assert!(matches!(err, CatalogError::Transaction(_)));

        let tables = db.snapshot().await;
        assert!(tables.authors.is_empty());
        assert!(tables.outbox.is_empty());
    }

    #[tokio::test]
    async fn joined_registration_follows_outer_transaction() {
        let db = InMemoryDatabase::new();
        let library = library(&db);

        let mut outer = UnitOfWork::begin(&db).await.unwrap();
        library
            .register_author_within(Some(outer.tx()), "Anna")
            .await
            .unwrap();
        outer.rollback().await.unwrap();

        assert_eq!(library.outbox_counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn updates_do_not_enqueue() {
        let db = InMemoryDatabase::new();
        let library = library(&db);

        let author = library.register_author("Anna").await.unwrap();
        let book = library.add_book("Poems", vec![author.id]).await.unwrap();
        let renamed = library.change_author_name(author.id, "Anna Andreevna").await.unwrap();
        assert_eq!(renamed.name, "Anna Andreevna");

        let co_author = library.register_author("Boris").await.unwrap();
        let updated = library
            .update_book(book.id, "Collected Poems", vec![author.id, co_author.id])
            .await
            .unwrap();
        assert_eq!(updated.author_ids, vec![author.id, co_author.id]);

        let counts = library.outbox_counts().await.unwrap();
        assert_eq!(counts.created, 3);

        let books = library.get_author_books(co_author.id).await.unwrap();
        assert_eq!(books, vec![updated]);
    }

    #[tokio::test]
    async fn author_books_of_unknown_author_is_not_found() {
        let db = InMemoryDatabase::new();
        let library = library(&db);

        let err = library.get_author_books(AuthorId::new()).await.unwrap_err();
        assert!(matches!(err, CatalogError::AuthorNotFound(_)));
    }
}
