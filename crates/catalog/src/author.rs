use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use library_core::{AuthorId, DomainError, DomainResult, Entity};

use crate::MAX_NAME_LEN;

/// A registered author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: AuthorId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Author {
    /// Create a new author with a fresh id.
    pub fn new(name: &str) -> DomainResult<Self> {
        let name = validate_author_name(name)?;
        let now = Utc::now();
        Ok(Self {
            id: AuthorId::new(),
            name,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace the author's name.
    pub fn rename(&mut self, name: &str) -> DomainResult<()> {
        self.name = validate_author_name(name)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl Entity for Author {
    type Id = AuthorId;

    const KIND: &'static str = "author";

    fn id(&self) -> AuthorId {
        self.id
    }
}

/// Validate an author name and return its trimmed form.
///
/// Names are alphanumeric words separated by single spaces.
pub fn validate_author_name(name: &str) -> DomainResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("author name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::validation(format!(
            "author name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    let well_formed = trimmed
        .split(' ')
        .all(|word| !word.is_empty() && word.chars().all(char::is_alphanumeric));
    if !well_formed {
        return Err(DomainError::validation(
            "author name must be alphanumeric words separated by single spaces",
        ));
    }
    Ok(trimmed.to_string())
}
