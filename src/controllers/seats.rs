use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use crate::error::AppError;
use crate::middleware::{AuthUser, LockerId};
use crate::models::Seat;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events/{event_id}/seats", get(get_seats))
        .route("/events/{event_id}/zones/{zone}/seats", get(get_zone_seats))
        .route("/events/{event_id}/seats/lock", post(lock_seats))
        .route("/events/{event_id}/seats/unlock", post(unlock_seats))
}

#[derive(Debug, Serialize)]
struct SeatsResponse {
    event_id: i64,
    zone: Option<String>,
    seats: Vec<Seat>,
}

// GET /api/events/{event_id}/seats
async fn get_seats(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let seats = state.seats.layout(event_id, None).await?;
    Ok((StatusCode::OK, Json(SeatsResponse { event_id, zone: None, seats })))
}

// GET /api/events/{event_id}/zones/{zone}/seats
async fn get_zone_seats(
    State(state): State<Arc<AppState>>,
    Path((event_id, zone)): Path<(i64, String)>,
) -> Result<impl IntoResponse, AppError> {
    let seats = state.seats.layout(event_id, Some(&zone)).await?;
    Ok((StatusCode::OK, Json(SeatsResponse { event_id, zone: Some(zone), seats })))
}

#[derive(Debug, Deserialize, Validate)]
struct LockSeatsRequest {
    #[validate(length(min = 1, max = 100))]
    seat_ids: Vec<i64>,
    #[validate(range(min = 1))]
    ttl_seconds: Option<i64>,
    /// Guest token; ignored for authenticated callers.
    locker_id: Option<String>,
}

// POST /api/events/{event_id}/seats/lock
async fn lock_seats(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
    user: Option<AuthUser>,
    Json(req): Json<LockSeatsRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let locker = LockerId::resolve(user.as_ref(), req.locker_id.as_deref())?;

    let grant = state
        .locks
        .lock(event_id, &req.seat_ids, &locker, req.ttl_seconds)
        .await?;

    Ok((StatusCode::OK, Json(grant)))
}

#[derive(Debug, Deserialize, Validate)]
struct UnlockSeatsRequest {
    #[validate(length(min = 1, max = 100))]
    seat_ids: Vec<i64>,
    locker_id: Option<String>,
}

// POST /api/events/{event_id}/seats/unlock
async fn unlock_seats(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
    user: Option<AuthUser>,
    Json(req): Json<UnlockSeatsRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let locker = LockerId::resolve(user.as_ref(), req.locker_id.as_deref())?;

    let outcome = state.locks.unlock(event_id, &req.seat_ids, &locker).await?;
    Ok((StatusCode::OK, Json(outcome)))
}
