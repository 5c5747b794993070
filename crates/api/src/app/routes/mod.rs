use axum::Router;

pub mod authors;
pub mod books;
pub mod outbox;
pub mod system;

/// Router for all versioned endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/v1/library/authors", authors::router())
        .nest("/v1/library/books", books::router())
        .nest("/v1/outbox", outbox::router())
}
