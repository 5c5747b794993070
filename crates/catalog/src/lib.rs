//! Catalog domain module.
//!
//! Authors and books as plain validated records (no IO, no HTTP, no storage).
//! Creating one of these records also queues an outbox message keyed by
//! [`outbox_key`]. Renames and book updates do not.

pub mod author;
pub mod book;

pub use author::{validate_author_name, Author};
pub use book::{validate_author_ids, validate_book_name, Book};

use library_core::Entity;

/// Maximum length (in characters) of an author or book name.
pub const MAX_NAME_LEN: usize = 512;

/// Idempotency key for the outbox message announcing `entity`: `<kind>_<id>`.
pub fn outbox_key<E: Entity>(entity: &E) -> String {
    format!("{}_{}", E::KIND, entity.id())
}
