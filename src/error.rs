use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::models::SeatAvailability;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("A locker id is required when not authenticated")]
    LockerIdRequired,

    #[error("A purchaser is required: authenticate or provide guest contact details")]
    IdentityRequired,

    #[error("Invalid credentials")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Seat lock limit exceeded: holding {active}, requested {requested}, max {max}")]
    SeatLockLimitExceeded { max: i64, active: i64, requested: i64 },

    #[error("Some requested seats are not available")]
    SeatLockConflict { seats: Vec<SeatAvailability> },

    #[error("Only {available} tickets available")]
    InsufficientInventory { available: i32 },

    #[error("Booking {0} is cancelled")]
    BookingCancelled(i64),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code returned to callers.
    pub const fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::LockerIdRequired => "LOCKER_ID_REQUIRED",
            AppError::IdentityRequired => "IDENTITY_REQUIRED",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::SeatLockLimitExceeded { .. } => "SEAT_LOCK_LIMIT_EXCEEDED",
            AppError::SeatLockConflict { .. } => "SEAT_LOCK_CONFLICT",
            AppError::InsufficientInventory { .. } => "INSUFFICIENT_INVENTORY",
            AppError::BookingCancelled(_) => "BOOKING_CANCELLED",
            AppError::Database(_) | AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::LockerIdRequired | AppError::IdentityRequired => {
                StatusCode::BAD_REQUEST
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SeatLockLimitExceeded { .. }
            | AppError::SeatLockConflict { .. }
            | AppError::InsufficientInventory { .. }
            | AppError::BookingCancelled(_) => StatusCode::CONFLICT,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Row that could not be mapped into a domain type.
    pub fn corrupt(message: String) -> Self {
        AppError::Internal(anyhow::anyhow!(message))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let body = match &self {
            AppError::Database(err) => {
                tracing::error!("database error: {:?}", err);
                json!({ "code": code, "message": "Internal server error" })
            }
            AppError::Internal(err) => {
                tracing::error!("internal error: {:#}", err);
                json!({ "code": code, "message": "Internal server error" })
            }
            AppError::SeatLockLimitExceeded { max, active, requested } => json!({
                "code": code,
                "message": self.to_string(),
                "max": max,
                "active": active,
                "requested": requested,
            }),
            AppError::SeatLockConflict { seats } => json!({
                "code": code,
                "message": self.to_string(),
                "seats": seats,
            }),
            AppError::InsufficientInventory { available } => json!({
                "code": code,
                "message": self.to_string(),
                "available": available,
            }),
            _ => json!({ "code": code, "message": self.to_string() }),
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
