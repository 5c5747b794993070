//! In-memory catalog repository (tests/dev).

use async_trait::async_trait;

use library_catalog::{Author, Book};
use library_core::{AuthorId, BookId};

use super::{CatalogError, CatalogRepository};
use crate::db::{MemoryTables, MemoryTx};

/// Catalog over the author/book tables of an [`InMemoryDatabase`](crate::db::InMemoryDatabase).
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryCatalogRepository;

impl InMemoryCatalogRepository {
    pub fn new() -> Self {
        Self
    }
}

fn ensure_authors_exist(tables: &MemoryTables, author_ids: &[AuthorId]) -> Result<(), CatalogError> {
    match author_ids.iter().find(|id| !tables.authors.contains_key(id)) {
        Some(missing) => Err(CatalogError::AuthorNotFound(*missing)),
        None => Ok(()),
    }
}

#[async_trait]
impl CatalogRepository for InMemoryCatalogRepository {
    type Tx = MemoryTx;

    async fn insert_author(&self, tx: &mut MemoryTx, author: &Author) -> Result<(), CatalogError> {
        if tx.tables().authors.contains_key(&author.id) {
            return Err(CatalogError::Storage(format!("author {} already exists", author.id)));
        }
        tx.put_author(author.clone());
        Ok(())
    }

    async fn update_author(&self, tx: &mut MemoryTx, author: &Author) -> Result<(), CatalogError> {
        if !tx.tables().authors.contains_key(&author.id) {
            return Err(CatalogError::AuthorNotFound(author.id));
        }
        tx.put_author(author.clone());
        Ok(())
    }

    async fn get_author(&self, tx: &mut MemoryTx, id: AuthorId) -> Result<Author, CatalogError> {
        tx.tables()
            .authors
            .get(&id)
            .cloned()
            .ok_or(CatalogError::AuthorNotFound(id))
    }

    async fn insert_book(&self, tx: &mut MemoryTx, book: &Book) -> Result<(), CatalogError> {
        let tables = tx.tables();
        ensure_authors_exist(tables, &book.author_ids)?;
        if tables.books.contains_key(&book.id) {
            return Err(CatalogError::Storage(format!("book {} already exists", book.id)));
        }
        tx.put_book(book.clone());
        Ok(())
    }

    async fn update_book(&self, tx: &mut MemoryTx, book: &Book) -> Result<(), CatalogError> {
        let tables = tx.tables();
        if !tables.books.contains_key(&book.id) {
            return Err(CatalogError::BookNotFound(book.id));
        }
        ensure_authors_exist(tables, &book.author_ids)?;
        tx.put_book(book.clone());
        Ok(())
    }

    async fn get_book(&self, tx: &mut MemoryTx, id: BookId) -> Result<Book, CatalogError> {
        tx.tables()
            .books
            .get(&id)
            .cloned()
            .ok_or(CatalogError::BookNotFound(id))
    }

    async fn books_by_author(
        &self,
        tx: &mut MemoryTx,
        author_id: AuthorId,
    ) -> Result<Vec<Book>, CatalogError> {
        let mut books: Vec<Book> = tx
            .tables()
            .books
            .values()
            .filter(|b| b.is_written_by(author_id))
            .cloned()
            .collect();
        books.sort_by_key(|b| (b.created_at, b.id));
        Ok(books)
    }
}
