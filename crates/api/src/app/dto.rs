use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::json;

use library_catalog::{Author, Book};
use library_core::AuthorId;
use library_infra::outbox::{KindStats, StatusCounts};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct AuthorRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct BookRequest {
    pub name: String,
    #[serde(default)]
    pub author_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

// -------------------------
// Mapping helpers
// -------------------------

pub fn parse_author_ids(raw: &[String]) -> Result<Vec<AuthorId>, axum::response::Response> {
    raw.iter().map(|id| errors::parse_id(id)).collect()
}

pub fn author_to_json(author: &Author) -> serde_json::Value {
    json!({
        "id": author.id.to_string(),
        "name": author.name,
        "created_at": author.created_at.to_rfc3339(),
        "updated_at": author.updated_at.to_rfc3339(),
    })
}

pub fn book_to_json(book: &Book) -> serde_json::Value {
    json!({
        "id": book.id.to_string(),
        "name": book.name,
        "author_ids": book.author_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        "created_at": book.created_at.to_rfc3339(),
        "updated_at": book.updated_at.to_rfc3339(),
    })
}

pub fn outbox_stats_to_json(
    enabled: bool,
    backend: &str,
    counts: StatusCounts,
    deliveries: BTreeMap<&'static str, KindStats>,
) -> serde_json::Value {
    json!({
        "enabled": enabled,
        "backend": backend,
        "rows": {
            "created": counts.created,
            "in_progress": counts.in_progress,
            "success": counts.success,
            "pending": counts.pending(),
        },
        "deliveries": deliveries,
    })
}
