use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use library_core::{AuthorId, BookId, DomainError, DomainResult, Entity};

use crate::MAX_NAME_LEN;

/// A catalog book and the authors credited for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub name: String,
    pub author_ids: Vec<AuthorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    /// Create a new book with a fresh id.
    ///
    /// Author existence is a storage concern; only the shape is checked here.
    pub fn new(name: &str, author_ids: Vec<AuthorId>) -> DomainResult<Self> {
        let name = validate_book_name(name)?;
        validate_author_ids(&author_ids)?;
        let now = Utc::now();
        Ok(Self {
            id: BookId::new(),
            name,
            author_ids,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace name and author list.
    pub fn update(&mut self, name: &str, author_ids: Vec<AuthorId>) -> DomainResult<()> {
        let name = validate_book_name(name)?;
        validate_author_ids(&author_ids)?;
        self.name = name;
        self.author_ids = author_ids;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_written_by(&self, author_id: AuthorId) -> bool {
        self.author_ids.contains(&author_id)
    }
}

impl Entity for Book {
    type Id = BookId;

    const KIND: &'static str = "book";

    fn id(&self) -> BookId {
        self.id
    }
}

/// Validate a book name and return its trimmed form.
pub fn validate_book_name(name: &str) -> DomainResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("book name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::validation(format!(
            "book name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Reject author lists that mention the same author twice.
pub fn validate_author_ids(author_ids: &[AuthorId]) -> DomainResult<()> {
    let mut seen = HashSet::with_capacity(author_ids.len());
    for id in author_ids {
        if !seen.insert(id) {
            return Err(DomainError::validation(format!("duplicate author id {id}")));
        }
    }
    Ok(())
}
