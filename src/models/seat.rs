use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Seat type reported for seats that carry no physical placement data.
pub const GENERIC_SEAT_TYPE: &str = "STANDARD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    Locked,
    Booked,
    Sold,
    Blocked,
    Maintenance,
}

impl SeatStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Locked => "LOCKED",
            Self::Booked => "BOOKED",
            Self::Sold => "SOLD",
            Self::Blocked => "BLOCKED",
            Self::Maintenance => "MAINTENANCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AVAILABLE" => Some(Self::Available),
            "LOCKED" => Some(Self::Locked),
            "BOOKED" => Some(Self::Booked),
            "SOLD" => Some(Self::Sold),
            "BLOCKED" => Some(Self::Blocked),
            "MAINTENANCE" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

/// Status a reader should see: a lock whose TTL has passed is AVAILABLE even
/// if no sweep has rewritten the row yet.
pub fn effective_status(
    status: SeatStatus,
    lock_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SeatStatus {
    match (status, lock_expires_at) {
        (SeatStatus::Locked, Some(expires_at)) if expires_at <= now => SeatStatus::Available,
        (SeatStatus::Locked, None) => SeatStatus::Available,
        (status, _) => status,
    }
}

/// How a seat is shown to buyers, resolved once when the row is mapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeatPresentation {
    Assigned {
        row: String,
        number: i32,
        price_cents: i64,
        seat_type: String,
    },
    Generic {
        default_price_cents: i64,
        seat_type: &'static str,
    },
}

impl SeatPresentation {
    pub fn resolve(
        row: Option<String>,
        number: Option<i32>,
        price_cents: Option<i64>,
        seat_type: Option<String>,
        category_price_cents: Option<i64>,
    ) -> Self {
        let default_price_cents = category_price_cents.unwrap_or(0);
        match (row, number) {
            (Some(row), Some(number)) => SeatPresentation::Assigned {
                row,
                number,
                price_cents: price_cents.unwrap_or(default_price_cents),
                seat_type: seat_type.unwrap_or_else(|| GENERIC_SEAT_TYPE.to_string()),
            },
            _ => SeatPresentation::Generic {
                default_price_cents: price_cents.unwrap_or(default_price_cents),
                seat_type: GENERIC_SEAT_TYPE,
            },
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SeatRow {
    pub id: i64,
    pub event_id: i64,
    pub category_id: Option<i64>,
    pub seat_ref: String,
    pub zone: Option<String>,
    pub row_label: Option<String>,
    pub seat_number: Option<i32>,
    pub seat_type: Option<String>,
    pub price_cents: Option<i64>,
    pub category_price_cents: Option<i64>,
    pub status: String,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub booking_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Seat {
    pub id: i64,
    pub event_id: i64,
    pub category_id: Option<i64>,
    pub seat_ref: String,
    pub zone: Option<String>,
    pub status: SeatStatus,
    pub presentation: SeatPresentation,
    #[serde(skip_serializing)]
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub booking_id: Option<i64>,
}

impl TryFrom<SeatRow> for Seat {
    type Error = String;

    fn try_from(row: SeatRow) -> Result<Self, Self::Error> {
        let status = SeatStatus::parse(&row.status)
            .ok_or_else(|| format!("seat {} has unknown status {}", row.id, row.status))?;

        Ok(Seat {
            id: row.id,
            event_id: row.event_id,
            category_id: row.category_id,
            seat_ref: row.seat_ref,
            zone: row.zone,
            status,
            presentation: SeatPresentation::resolve(
                row.row_label,
                row.seat_number,
                row.price_cents,
                row.seat_type,
                row.category_price_cents,
            ),
            locked_by: row.locked_by,
            lock_expires_at: row.lock_expires_at,
            booking_id: row.booking_id,
        })
    }
}

/// Current effective status of one requested seat, returned with lock and
/// booking conflicts so the caller can retarget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeatAvailability {
    pub seat_id: i64,
    pub status: SeatStatus,
    pub held_by_requester: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_round_trips_through_its_column_value() {
        for status in [
            SeatStatus::Available,
            SeatStatus::Locked,
            SeatStatus::Booked,
            SeatStatus::Sold,
            SeatStatus::Blocked,
            SeatStatus::Maintenance,
        ] {
            assert_eq!(SeatStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SeatStatus::parse("FREE"), None);
    }

    #[test]
    fn expired_lock_reads_as_available() {
        let now = Utc::now();
        let expired = effective_status(SeatStatus::Locked, Some(now - Duration::seconds(1)), now);
        let live = effective_status(SeatStatus::Locked, Some(now + Duration::seconds(60)), now);

        assert_eq!(expired, SeatStatus::Available);
        assert_eq!(live, SeatStatus::Locked);
    }

    #[test]
    fn non_lock_statuses_are_not_folded() {
        let now = Utc::now();
        let past = Some(now - Duration::seconds(10));
        assert_eq!(effective_status(SeatStatus::Booked, past, now), SeatStatus::Booked);
        assert_eq!(effective_status(SeatStatus::Maintenance, None, now), SeatStatus::Maintenance);
    }

    #[test]
    fn placed_seat_resolves_to_assigned_with_category_fallback_price() {
        let presentation = SeatPresentation::resolve(
            Some("B".to_string()),
            Some(7),
            None,
            None,
            Some(4500),
        );

        assert_eq!(
            presentation,
            SeatPresentation::Assigned {
                row: "B".to_string(),
                number: 7,
                price_cents: 4500,
                seat_type: GENERIC_SEAT_TYPE.to_string(),
            }
        );
    }

    #[test]
    fn seat_without_placement_resolves_to_generic() {
        let presentation = SeatPresentation::resolve(None, Some(3), None, Some("VIP".to_string()), Some(900));

        assert_eq!(
            presentation,
            SeatPresentation::Generic {
                default_price_cents: 900,
                seat_type: GENERIC_SEAT_TYPE,
            }
        );
    }

    #[test]
    fn unknown_status_in_row_is_rejected() {
        let row = SeatRow {
            id: 1,
            event_id: 1,
            category_id: None,
            seat_ref: "A-1".to_string(),
            zone: None,
            row_label: None,
            seat_number: None,
            seat_type: None,
            price_cents: None,
            category_price_cents: None,
            status: "RESERVED".to_string(),
            locked_by: None,
            lock_expires_at: None,
            booking_id: None,
        };

        assert!(Seat::try_from(row).is_err());
    }
}
