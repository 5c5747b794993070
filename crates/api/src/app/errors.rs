use std::str::FromStr;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use library_core::DomainError;
use library_infra::catalog::CatalogError;

pub fn catalog_error_to_response(err: CatalogError) -> axum::response::Response {
    match err {
        CatalogError::Domain(DomainError::Validation(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        CatalogError::Domain(DomainError::InvalidId(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_id", msg)
        }
        CatalogError::Domain(DomainError::NotFound(msg)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", msg)
        }
        CatalogError::AuthorNotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "author_not_found",
            format!("author {id} not found"),
        ),
        CatalogError::BookNotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "book_not_found",
            format!("book {id} not found"),
        ),
        other => {
            tracing::error!(error = %other, "catalog operation failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path or body id, answering 400 on failure.
pub fn parse_id<I>(raw: &str) -> Result<I, axum::response::Response>
where
    I: FromStr<Err = DomainError>,
{
    raw.trim()
        .parse()
        .map_err(|e: DomainError| json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}
