//! Seat registry: the only place that reads seat rows for callers and folds
//! lapsed locks back into availability.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::database::Database;
use crate::error::{AppError, Result};
use crate::middleware::LockerId;
use crate::models::seat::{effective_status, SeatRow};
use crate::models::{Event, Seat, SeatAvailability, SeatStatus};

const SEAT_COLUMNS: &str = r#"
    s.id, s.event_id, s.category_id, s.seat_ref, s.zone, s.row_label, s.seat_number,
    s.seat_type, s.price_cents, c.default_price_cents AS category_price_cents,
    s.status, s.locked_by, s.lock_expires_at, s.booking_id
"#;

/// Flips every lapsed lock of one event back to AVAILABLE. Returns how many
/// seats were reclaimed.
pub async fn sweep_expired_locks<'e, E>(executor: E, event_id: i64) -> Result<u64>
where
    E: sqlx::PgExecutor<'e>,
{
    let swept = sqlx::query(
        r#"
        UPDATE seats
        SET status = 'AVAILABLE', locked_by = NULL, lock_expires_at = NULL, updated_at = NOW()
        WHERE event_id = $1 AND status = 'LOCKED' AND lock_expires_at <= NOW()
        "#,
    )
    .bind(event_id)
    .execute(executor)
    .await?
    .rows_affected();

    if swept > 0 {
        debug!("Swept {} expired seat locks for event {}", swept, event_id);
    }
    Ok(swept)
}

/// Effective status of each requested seat, in request order. Lapsed locks
/// read as AVAILABLE. Seats that do not belong to the event yield `NotFound`.
pub async fn current_availability<'e, E>(
    executor: E,
    event_id: i64,
    seat_ids: &[i64],
    requester: Option<&LockerId>,
) -> Result<Vec<SeatAvailability>>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<(i64, String, Option<String>, Option<DateTime<Utc>>, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT id, status, locked_by, lock_expires_at, NOW()
        FROM seats
        WHERE event_id = $1 AND id = ANY($2)
        "#,
    )
    .bind(event_id)
    .bind(seat_ids)
    .fetch_all(executor)
    .await?;

    let mut by_id = HashMap::with_capacity(rows.len());
    for (id, status, locked_by, expires_at, now) in rows {
        let status = SeatStatus::parse(&status)
            .ok_or_else(|| AppError::corrupt(format!("seat {id} has unknown status {status}")))?;
        let effective = effective_status(status, expires_at, now);
        let held_by_requester = effective == SeatStatus::Locked
            && requester.is_some_and(|r| locked_by.as_deref() == Some(r.as_str()));
        by_id.insert(id, SeatAvailability { seat_id: id, status: effective, held_by_requester });
    }

    let missing: Vec<i64> = seat_ids.iter().copied().filter(|id| !by_id.contains_key(id)).collect();
    if !missing.is_empty() {
        return Err(AppError::NotFound(format!("Seats {missing:?} in event {event_id}")));
    }

    Ok(seat_ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

#[derive(Clone)]
pub struct SeatRegistry {
    db: Database,
}

impl SeatRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Seat layout of an event, optionally narrowed to one zone. Sweeps the
    /// event's lapsed locks first so readers never see a stale LOCKED seat.
    pub async fn layout(&self, event_id: i64, zone: Option<&str>) -> Result<Vec<Seat>> {
        Event::find(&self.db.pool, event_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Event {event_id}")))?;

        sweep_expired_locks(&self.db.pool, event_id).await?;

        let query = format!(
            r#"
            SELECT {SEAT_COLUMNS}
            FROM seats s
            LEFT JOIN ticket_categories c ON c.id = s.category_id
            WHERE s.event_id = $1 AND ($2::TEXT IS NULL OR s.zone = $2)
            ORDER BY s.zone NULLS FIRST, s.row_label NULLS FIRST, s.seat_number NULLS FIRST, s.id
            "#
        );

        let rows = sqlx::query_as::<_, SeatRow>(&query)
            .bind(event_id)
            .bind(zone)
            .fetch_all(&self.db.pool)
            .await?;

        rows.into_iter()
            .map(|row| Seat::try_from(row).map_err(AppError::corrupt))
            .collect()
    }
}
