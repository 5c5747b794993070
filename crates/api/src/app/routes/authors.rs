use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use library_core::AuthorId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(register_author))
        .route("/:id", get(get_author).put(change_author_name))
        .route("/:id/books", get(get_author_books))
}

pub async fn register_author(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::AuthorRequest>,
) -> axum::response::Response {
    match services.catalog.register_author(&body.name).await {
        Ok(author) => (StatusCode::CREATED, Json(dto::author_to_json(&author))).into_response(),
        Err(e) => errors::catalog_error_to_response(e),
    }
}

pub async fn get_author(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: AuthorId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.catalog.get_author(id).await {
        Ok(author) => (StatusCode::OK, Json(dto::author_to_json(&author))).into_response(),
        Err(e) => errors::catalog_error_to_response(e),
    }
}

pub async fn change_author_name(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::AuthorRequest>,
) -> axum::response::Response {
    let id: AuthorId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.catalog.change_author_name(id, &body.name).await {
        Ok(author) => (StatusCode::OK, Json(dto::author_to_json(&author))).into_response(),
        Err(e) => errors::catalog_error_to_response(e),
    }
}

pub async fn get_author_books(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: AuthorId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.catalog.get_author_books(id).await {
        Ok(books) => {
            let items = books.iter().map(dto::book_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::catalog_error_to_response(e),
    }
}
