use axum::{
    routing::{get, post},
    Router,
};

pub mod batches;
pub mod deliveries;
pub mod system;

/// Router for producer intake and operator queries.
pub fn router() -> Router {
    Router::new()
        .route("/batches", post(batches::submit_batch))
        .route("/deliveries", get(deliveries::list_deliveries))
        .route("/deliveries/stats", get(deliveries::delivery_stats))
        .route("/deliveries/:id", get(deliveries::get_delivery))
}
