use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use batchrelay_infra::{DeliveryServiceError, QueueStoreError};

pub fn store_error_to_response(err: QueueStoreError) -> axum::response::Response {
    match err {
        QueueStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("delivery record {id} not found"))
        }
        QueueStoreError::Conflict { .. } => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        QueueStoreError::Domain(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        QueueStoreError::Constraint(msg) => json_error(StatusCode::CONFLICT, "constraint_violation", msg),
        QueueStoreError::Decode(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "decode_error", msg)
        }
        QueueStoreError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn delivery_error_to_response(err: DeliveryServiceError) -> axum::response::Response {
    match err {
        DeliveryServiceError::Idempotency(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "idempotency_unavailable", e.to_string())
        }
        err @ DeliveryServiceError::Enqueue { .. } => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "enqueue_failed", err.to_string())
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
