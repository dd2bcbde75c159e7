use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use batchrelay_core::BatchPayload;
use batchrelay_infra::DeliveryOutcome;

use crate::app::errors;
use crate::app::services::AppServices;

/// First-attempt delivery of a freshly produced batch.
///
/// Delivered and duplicate batches answer 200; a batch handed to the retry
/// queue answers 202. A 500 means the batch was neither delivered nor stored
/// and the producer must not acknowledge it.
pub async fn submit_batch(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<BatchPayload>, JsonRejection>,
) -> axum::response::Response {
    let Json(batch) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", rejection.body_text());
        }
    };

    if batch.batch_id.as_str().trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", "batchId must not be blank");
    }

    if services.shutdown().is_shutting_down() {
        return errors::json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            "not accepting new batches during shutdown",
        );
    }

    match services.deliveries().attempt_delivery(&batch).await {
        Ok(outcome @ DeliveryOutcome::Enqueued { .. }) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::delivery_error_to_response(e),
    }
}
