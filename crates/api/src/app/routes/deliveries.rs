use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use batchrelay_core::{DeliveryStatus, RecordId};
use batchrelay_infra::{QueueStore, QueueStoreError};

use crate::app::errors;
use crate::app::services::AppServices;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListDeliveriesQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// Records in one status, oldest first. Defaults to FAILED for triage.
pub async fn list_deliveries(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListDeliveriesQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref() {
        None => DeliveryStatus::Failed,
        Some(raw) => match raw.parse::<DeliveryStatus>() {
            Ok(s) => s,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string()),
        },
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    match services.store().list_by_status(status, limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn delivery_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.store().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_delivery(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: RecordId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid record id"),
    };

    match services.store().get(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => errors::store_error_to_response(QueueStoreError::NotFound(id)),
        Err(e) => errors::store_error_to_response(e),
    }
}
