//! Postgres-backed catalog repository.
//!
//! Book authorship lives in `author_book`; `position` preserves the order in
//! which authors were listed. Author existence is checked up front so a bad id
//! surfaces as `AuthorNotFound` instead of a foreign-key violation.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::instrument;
use uuid::Uuid;

use library_catalog::{Author, Book};
use library_core::{AuthorId, BookId};

use super::{CatalogError, CatalogRepository};
use crate::db::PgTx;

const SELECT_BOOKS: &str = r#"
    SELECT
        b.id,
        b.name,
        b.created_at,
        b.updated_at,
        COALESCE(
            array_agg(ab.author_id ORDER BY ab.position)
                FILTER (WHERE ab.author_id IS NOT NULL),
            '{}'
        ) AS author_ids
    FROM book b
    LEFT JOIN author_book ab ON ab.book_id = b.id
"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresCatalogRepository;

impl PostgresCatalogRepository {
    pub fn new() -> Self {
        Self
    }
}

async fn ensure_authors_exist(tx: &mut PgTx, author_ids: &[AuthorId]) -> Result<(), CatalogError> {
    if author_ids.is_empty() {
        return Ok(());
    }
    let wanted: Vec<Uuid> = author_ids.iter().map(|id| *id.as_uuid()).collect();
    let rows = sqlx::query("SELECT id FROM author WHERE id = ANY($1)")
        .bind(&wanted)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| CatalogError::database("ensure_authors_exist", e))?;

    let mut found = Vec::with_capacity(rows.len());
    for row in rows {
        let id: Uuid = row
            .try_get("id")
            .map_err(|e| CatalogError::database("ensure_authors_exist", e))?;
        found.push(id);
    }

    match author_ids.iter().find(|id| !found.contains(id.as_uuid())) {
        Some(missing) => Err(CatalogError::AuthorNotFound(*missing)),
        None => Ok(()),
    }
}

async fn link_authors(tx: &mut PgTx, book: &Book) -> Result<(), CatalogError> {
    if book.author_ids.is_empty() {
        return Ok(());
    }
    let author_ids: Vec<Uuid> = book.author_ids.iter().map(|id| *id.as_uuid()).collect();
    let positions: Vec<i32> = (0..).take(author_ids.len()).collect();

    sqlx::query(
        r#"
        INSERT INTO author_book (author_id, book_id, position)
        SELECT author_id, $3, position
        FROM UNNEST($1::uuid[], $2::int4[]) AS t(author_id, position)
        "#,
    )
    .bind(&author_ids)
    .bind(&positions)
    .bind(book.id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| CatalogError::database("link_authors", e))?;

    Ok(())
}

fn author_from_row(row: &PgRow) -> Result<Author, sqlx::Error> {
    let id: Uuid = row.try_get("id")?;
    Ok(Author {
        id: AuthorId::from_uuid(id),
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn book_from_row(row: &PgRow) -> Result<Book, sqlx::Error> {
    let id: Uuid = row.try_get("id")?;
    let author_ids: Vec<Uuid> = row.try_get("author_ids")?;
    Ok(Book {
        id: BookId::from_uuid(id),
        name: row.try_get("name")?,
        author_ids: author_ids.into_iter().map(AuthorId::from_uuid).collect(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CatalogRepository for PostgresCatalogRepository {
    type Tx = PgTx;

    #[instrument(skip(self, tx, author), fields(author_id = %author.id), err)]
    async fn insert_author(&self, tx: &mut PgTx, author: &Author) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            INSERT INTO author (id, name, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(author.id.as_uuid())
        .bind(&author.name)
        .bind(author.created_at)
        .bind(author.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| CatalogError::database("insert_author", e))?;

        Ok(())
    }

    #[instrument(skip(self, tx, author), fields(author_id = %author.id), err)]
    async fn update_author(&self, tx: &mut PgTx, author: &Author) -> Result<(), CatalogError> {
        let result = sqlx::query("UPDATE author SET name = $2, updated_at = $3 WHERE id = $1")
            .bind(author.id.as_uuid())
            .bind(&author.name)
            .bind(author.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| CatalogError::database("update_author", e))?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::AuthorNotFound(author.id));
        }
        Ok(())
    }

    async fn get_author(&self, tx: &mut PgTx, id: AuthorId) -> Result<Author, CatalogError> {
        let row = sqlx::query("SELECT id, name, created_at, updated_at FROM author WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| CatalogError::database("get_author", e))?
            .ok_or(CatalogError::AuthorNotFound(id))?;

        author_from_row(&row).map_err(|e| CatalogError::database("get_author", e))
    }

    #[instrument(skip(self, tx, book), fields(book_id = %book.id), err)]
    async fn insert_book(&self, tx: &mut PgTx, book: &Book) -> Result<(), CatalogError> {
        ensure_authors_exist(tx, &book.author_ids).await?;

        sqlx::query(
            r#"
            INSERT INTO book (id, name, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(book.id.as_uuid())
        .bind(&book.name)
        .bind(book.created_at)
        .bind(book.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| CatalogError::database("insert_book", e))?;

        link_authors(tx, book).await
    }

    #[instrument(skip(self, tx, book), fields(book_id = %book.id), err)]
    async fn update_book(&self, tx: &mut PgTx, book: &Book) -> Result<(), CatalogError> {
        let result = sqlx::query("UPDATE book SET name = $2, updated_at = $3 WHERE id = $1")
            .bind(book.id.as_uuid())
            .bind(&book.name)
            .bind(book.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| CatalogError::database("update_book", e))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::BookNotFound(book.id));
        }

        ensure_authors_exist(tx, &book.author_ids).await?;

        sqlx::query("DELETE FROM author_book WHERE book_id = $1")
            .bind(book.id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| CatalogError::database("update_book", e))?;

        link_authors(tx, book).await
    }

    async fn get_book(&self, tx: &mut PgTx, id: BookId) -> Result<Book, CatalogError> {
        let query = format!("{SELECT_BOOKS} WHERE b.id = $1 GROUP BY b.id");
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| CatalogError::database("get_book", e))?
            .ok_or(CatalogError::BookNotFound(id))?;

        book_from_row(&row).map_err(|e| CatalogError::database("get_book", e))
    }

    async fn books_by_author(
        &self,
        tx: &mut PgTx,
        author_id: AuthorId,
    ) -> Result<Vec<Book>, CatalogError> {
        let query = format!(
            "{SELECT_BOOKS}
            WHERE b.id IN (SELECT book_id FROM author_book WHERE author_id = $1)
            GROUP BY b.id
            ORDER BY b.created_at, b.id"
        );
        let rows = sqlx::query(&query)
            .bind(author_id.as_uuid())
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| CatalogError::database("books_by_author", e))?;

        rows.iter()
            .map(book_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CatalogError::database("books_by_author", e))
    }
}
