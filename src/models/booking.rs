use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Refunded,
}

impl BookingStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "CONFIRMED" => Some(Self::Confirmed),
            "CANCELLED" => Some(Self::Cancelled),
            "REFUNDED" => Some(Self::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Pending,
    Active,
    Cancelled,
}

impl TicketStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "ACTIVE" => Some(Self::Active),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BookingRow {
    pub id: i64,
    pub user_id: i64,
    pub event_id: i64,
    pub category_id: i64,
    pub quantity: i32,
    pub total_price_cents: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Booking {
    pub id: i64,
    pub user_id: i64,
    pub event_id: i64,
    pub category_id: i64,
    pub quantity: i32,
    pub total_price_cents: i64,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = String;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status = BookingStatus::parse(&row.status)
            .ok_or_else(|| format!("booking {} has unknown status {}", row.id, row.status))?;
        Ok(Booking {
            id: row.id,
            user_id: row.user_id,
            event_id: row.event_id,
            category_id: row.category_id,
            quantity: row.quantity,
            total_price_cents: row.total_price_cents,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TicketRow {
    pub id: i64,
    pub booking_id: i64,
    pub seat_id: Option<i64>,
    pub price_cents: i64,
    pub status: String,
    pub qr_code: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ticket {
    pub id: i64,
    pub booking_id: i64,
    pub seat_id: Option<i64>,
    pub price_cents: i64,
    pub status: TicketStatus,
    pub qr_code: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = String;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let status = TicketStatus::parse(&row.status)
            .ok_or_else(|| format!("ticket {} has unknown status {}", row.id, row.status))?;
        Ok(Ticket {
            id: row.id,
            booking_id: row.booking_id,
            seat_id: row.seat_id,
            price_cents: row.price_cents,
            status,
            qr_code: row.qr_code,
            issued_at: row.issued_at,
        })
    }
}

/// Booking with everything hanging off it, as returned to readers.
#[derive(Debug, Clone, Serialize)]
pub struct BookingDetails {
    #[serde(flatten)]
    pub booking: Booking,
    pub seat_ids: Vec<i64>,
    pub tickets: Vec<Ticket>,
}
