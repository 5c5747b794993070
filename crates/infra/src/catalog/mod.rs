//! Catalog persistence: authors, books and which author wrote which book.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryCatalogRepository;
pub use postgres::PostgresCatalogRepository;

use std::sync::Arc;

use async_trait::async_trait;

use library_catalog::{Author, Book};
use library_core::{AuthorId, BookId, DomainError};

use crate::db::TxError;
use crate::outbox::OutboxError;

/// Author/book storage. Every call runs on the caller's transaction.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    type Tx: Send + 'static;

    async fn insert_author(&self, tx: &mut Self::Tx, author: &Author) -> Result<(), CatalogError>;

    /// Overwrite a stored author. Fails with `AuthorNotFound` if it does not exist.
    async fn update_author(&self, tx: &mut Self::Tx, author: &Author) -> Result<(), CatalogError>;

    async fn get_author(&self, tx: &mut Self::Tx, id: AuthorId) -> Result<Author, CatalogError>;

    /// Insert a book. Every listed author must exist.
    async fn insert_book(&self, tx: &mut Self::Tx, book: &Book) -> Result<(), CatalogError>;

    /// Overwrite a stored book, author list included. Every listed author must exist.
    async fn update_book(&self, tx: &mut Self::Tx, book: &Book) -> Result<(), CatalogError>;

    async fn get_book(&self, tx: &mut Self::Tx, id: BookId) -> Result<Book, CatalogError>;

    /// Books crediting `author_id`, oldest first.
    async fn books_by_author(
        &self,
        tx: &mut Self::Tx,
        author_id: AuthorId,
    ) -> Result<Vec<Book>, CatalogError>;
}

#[async_trait]
impl<R: CatalogRepository + ?Sized> CatalogRepository for Arc<R> {
    type Tx = R::Tx;

    async fn insert_author(&self, tx: &mut Self::Tx, author: &Author) -> Result<(), CatalogError> {
        (**self).insert_author(tx, author).await
    }

    async fn update_author(&self, tx: &mut Self::Tx, author: &Author) -> Result<(), CatalogError> {
        (**self).update_author(tx, author).await
    }

    async fn get_author(&self, tx: &mut Self::Tx, id: AuthorId) -> Result<Author, CatalogError> {
        (**self).get_author(tx, id).await
    }

    async fn insert_book(&self, tx: &mut Self::Tx, book: &Book) -> Result<(), CatalogError> {
        (**self).insert_book(tx, book).await
    }

    async fn update_book(&self, tx: &mut Self::Tx, book: &Book) -> Result<(), CatalogError> {
        (**self).update_book(tx, book).await
    }

    async fn get_book(&self, tx: &mut Self::Tx, id: BookId) -> Result<Book, CatalogError> {
        (**self).get_book(tx, id).await
    }

    async fn books_by_author(
        &self,
        tx: &mut Self::Tx,
        author_id: AuthorId,
    ) -> Result<Vec<Book>, CatalogError> {
        (**self).books_by_author(tx, author_id).await
    }
}

/// Catalog error.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("author {0} not found")]
    AuthorNotFound(AuthorId),

    #[error("book {0} not found")]
    BookNotFound(BookId),

    #[error("catalog storage error: {0}")]
    Storage(String),

    #[error("database error in {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Transaction(#[from] TxError),
}

impl CatalogError {
    pub(crate) fn database(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Database { operation, source }
    }

    /// `true` for errors caused by the request rather than the backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CatalogError::Domain(_) | CatalogError::AuthorNotFound(_) | CatalogError::BookNotFound(_)
        )
    }
}
