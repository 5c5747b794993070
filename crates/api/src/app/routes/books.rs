use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use library_core::BookId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(add_book))
        .route("/:id", get(get_book).put(update_book))
}

pub async fn add_book(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::BookRequest>,
) -> axum::response::Response {
    let author_ids = match dto::parse_author_ids(&body.author_ids) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.catalog.add_book(&body.name, author_ids).await {
        Ok(book) => (StatusCode::CREATED, Json(dto::book_to_json(&book))).into_response(),
        Err(e) => errors::catalog_error_to_response(e),
    }
}

pub async fn get_book(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: BookId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.catalog.get_book(id).await {
        Ok(book) => (StatusCode::OK, Json(dto::book_to_json(&book))).into_response(),
        Err(e) => errors::catalog_error_to_response(e),
    }
}

pub async fn update_book(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::BookRequest>,
) -> axum::response::Response {
    let id: BookId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let author_ids = match dto::parse_author_ids(&body.author_ids) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.catalog.update_book(id, &body.name, author_ids).await {
        Ok(book) => (StatusCode::OK, Json(dto::book_to_json(&book))).into_response(),
        Err(e) => errors::catalog_error_to_response(e),
    }
}
