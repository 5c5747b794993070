//! `library-core`: shared domain primitives for the library service.
//!
//! Pure types only: identifiers, the domain error model, and the entity trait.
//! No storage, no HTTP, no async.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AuthorId, BookId};
