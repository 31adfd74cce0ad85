//! Combines the per-module routers into the single API surface served by
//! `main`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::shared::state::AppState;

pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(crate::goals::configure_goal_routes())
        .merge(crate::metrics::configure_metric_routes())
        .merge(crate::requests::configure_request_routes())
        .merge(crate::departments::configure_department_routes())
        .merge(crate::directory::configure_directory_routes())
        .merge(crate::notify::configure_notify_routes())
        .merge(crate::maintenance::configure_maintenance_routes())
        .route("/health", get(health_check))
}

pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = state.conn.get().is_ok();
    let status = if db_ok { "healthy" } else { "degraded" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "service": "trackify-server",
            "version": env!("CARGO_PKG_VERSION"),
            "database": db_ok
        })),
    )
}
