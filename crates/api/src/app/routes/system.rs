use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde_json::json;

use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> Json<serde_json::Value> {
    let shutdown = services.shutdown();
    Json(json!({
        "status": "ok",
        "inFlight": shutdown.in_flight(),
        "shuttingDown": shutdown.is_shutting_down(),
    }))
}
