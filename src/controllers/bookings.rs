use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

use crate::error::AppError;
use crate::middleware::{AuthUser, LockerId};
use crate::services::bookings::{CreateBooking, GuestContact, Purchaser};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/{booking_id}", get(get_booking))
        .route("/bookings/{booking_id}/confirm", post(confirm_booking))
        .route("/bookings/{booking_id}/cancel", post(cancel_booking))
}

#[derive(Debug, Deserialize, Validate)]
struct GuestContactRequest {
    #[validate(email)]
    email: String,
    #[validate(length(min = 1, max = 100))]
    first_name: String,
    #[validate(length(min = 1, max = 100))]
    last_name: String,
}

// POST /api/bookings
#[derive(Debug, Deserialize, Validate)]
struct CreateBookingRequest {
    #[validate(range(min = 1))]
    event_id: i64,
    #[validate(range(min = 1))]
    category_id: i64,
    #[validate(range(min = 1, max = 100))]
    quantity: i32,
    #[validate(length(max = 100))]
    seat_ids: Option<Vec<i64>>,
    locker_id: Option<String>,
    #[validate(nested)]
    guest: Option<GuestContactRequest>,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    user: Option<AuthUser>,
    Json(req): Json<CreateBookingRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;

    let purchaser = match (&user, req.guest) {
        (Some(user), _) => Purchaser::User(user.user_id),
        (None, Some(guest)) => Purchaser::Guest(GuestContact {
            email: guest.email,
            first_name: guest.first_name,
            last_name: guest.last_name,
        }),
        (None, None) => return Err(AppError::IdentityRequired),
    };

    // Holds are only convertible by the identity that placed them
    let locker = match (&user, req.locker_id.as_deref()) {
        (None, None) => None,
        (user, token) => Some(LockerId::resolve(user.as_ref(), token)?),
    };

    let created = state
        .bookings
        .create(CreateBooking {
            event_id: req.event_id,
            category_id: req.category_id,
            quantity: req.quantity,
            seat_ids: req.seat_ids,
            locker,
            purchaser,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

// GET /api/bookings/{booking_id}
async fn get_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let booking = state.bookings.get(booking_id).await?;
    Ok((StatusCode::OK, Json(booking)))
}

// POST /api/bookings/{booking_id}/confirm
async fn confirm_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.bookings.confirm(booking_id).await?;
    Ok((StatusCode::OK, Json(outcome)))
}

// POST /api/bookings/{booking_id}/cancel
async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.bookings.cancel(booking_id).await?;
    Ok((StatusCode::OK, Json(outcome)))
}
