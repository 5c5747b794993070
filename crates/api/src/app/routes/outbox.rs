use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/enabled", post(set_enabled))
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let counts = match services.catalog.outbox_counts().await {
        Ok(c) => c,
        Err(e) => return errors::catalog_error_to_response(e),
    };
    let body = dto::outbox_stats_to_json(
        services.switch.is_enabled(),
        services.backend_name(),
        counts,
        services.stats.snapshot(),
    );
    (StatusCode::OK, Json(body)).into_response()
}

/// Pause or resume claiming. Running cycles finish normally.
pub async fn set_enabled(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SetEnabledRequest>,
) -> axum::response::Response {
    services.switch.set(body.enabled);
    tracing::info!(enabled = body.enabled, "outbox dispatcher switch changed");
    (StatusCode::OK, Json(serde_json::json!({ "enabled": body.enabled }))).into_response()
}
