use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::error::AppError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/queues/stats", get(queue_stats))
}

// GET /api/queues/stats
async fn queue_stats(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let tickets = state.tickets.stats().await?;
    let reservations = state.expiry.stats().await?;

    Ok(Json(json!({
        "ticket_generation": tickets,
        "reservation_expiry": reservations,
    })))
}
