//! Booking orchestration: turns held or free inventory into a booking, confirms
//! it, and reverses it on cancellation.
//!
//! Every operation runs in one transaction per booking. The category counter
//! `booked_seats` is the authority for how much of a category is left, for
//! seat-map and generic categories alike; seat rows only say *which* seat is
//! whose, and move in the same transaction as the counter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use validator::ValidateEmail;

use crate::config::{ReservationConfig, TicketQueueConfig};
use crate::database::{Database, Tx};
use crate::error::{AppError, Result};
use crate::middleware::LockerId;
use crate::models::booking::{BookingRow, TicketRow};
use crate::models::user::normalize_email;
use crate::models::{Booking, BookingDetails, BookingStatus, Event, Ticket, TicketCategory, User};
use crate::services::expiry::ExpiryReconciler;
use crate::services::locks::normalize_seat_ids;
use crate::services::seats::current_availability;
use crate::services::tickets::TicketQueue;

const BOOKING_COLUMNS: &str =
    "id, user_id, event_id, category_id, quantity, total_price_cents, status, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct GuestContact {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone)]
pub enum Purchaser {
    User(i64),
    Guest(GuestContact),
}

#[derive(Debug, Clone)]
pub struct CreateBooking {
    pub event_id: i64,
    pub category_id: i64,
    pub quantity: i32,
    pub seat_ids: Option<Vec<i64>>,
    /// Holder whose locks may be converted into this booking.
    pub locker: Option<LockerId>,
    pub purchaser: Purchaser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    SpecificSeats,
    GenericInventory,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedBooking {
    pub booking_id: i64,
    pub status: BookingStatus,
    pub mode: AssignmentMode,
    pub seat_ids: Vec<i64>,
    pub ticket_ids: Vec<i64>,
    pub total_price_cents: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TransitionOutcome {
    pub booking_id: i64,
    pub status: BookingStatus,
    /// False when the booking was already in the target state.
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Expiry path: only bookings still waiting for payment.
    PendingOnly,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled { released_seats: u64, quantity: i32 },
    Unchanged(BookingStatus),
    NotFound,
}

/// Seats a create request resolved to, with the price each one sells at.
struct ResolvedSeat {
    id: i64,
    price_cents: i64,
}

#[derive(Clone)]
pub struct BookingOrchestrator {
    db: Database,
    reservations: ReservationConfig,
    tickets: TicketQueueConfig,
}

impl BookingOrchestrator {
    pub fn new(db: Database, reservations: ReservationConfig, tickets: TicketQueueConfig) -> Self {
        Self { db, reservations, tickets }
    }

    pub async fn create(&self, request: CreateBooking) -> Result<CreatedBooking> {
        if request.quantity < 1 {
            return Err(AppError::Validation("quantity must be >= 1".to_string()));
        }
        let requested_seats = match request.seat_ids.as_deref() {
            Some(ids) if !ids.is_empty() => Some(normalize_seat_ids(ids)?),
            _ => None,
        };

        // 1. Категория и событие
        Event::find(&self.db.pool, request.event_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Event {}", request.event_id)))?;

        let category = sqlx::query_as::<_, TicketCategory>(
            r#"
            SELECT id, event_id, name, default_price_cents, total_seats, booked_seats
            FROM ticket_categories
            WHERE id = $1 AND event_id = $2
            "#,
        )
        .bind(request.category_id)
        .bind(request.event_id)
        .fetch_optional(&self.db.pool)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Ticket category {} for event {}",
                request.category_id, request.event_id
            ))
        })?;

        // 2. Доступность
        if !category.can_fit(request.quantity) {
            return Err(AppError::InsufficientInventory { available: category.available() });
        }

        let seats = match requested_seats {
            Some(ids) => self.resolve_seats(&category, &ids, request.quantity).await?,
            None => Vec::new(),
        };
        let mode = if seats.is_empty() {
            AssignmentMode::GenericInventory
        } else {
            AssignmentMode::SpecificSeats
        };

        // 3. Покупатель
        let guest_hash = match &request.purchaser {
            Purchaser::Guest(contact) => {
                validate_guest(contact)?;
                match User::find_by_email(&self.db.pool, &contact.email).await? {
                    Some(_) => None,
                    None => Some(self.placeholder_password_hash().await?),
                }
            }
            Purchaser::User(_) => None,
        };

        let mut tx = self.db.begin().await?;

        let user_id = match &request.purchaser {
            Purchaser::User(id) => *id,
            Purchaser::Guest(contact) => match guest_hash {
                Some(hash) => {
                    User::insert_guest(&mut tx, &contact.email, &contact.first_name, &contact.last_name, &hash)
                        .await?
                        .id
                }
                None => User::find_by_email(&mut *tx, &contact.email)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("User {}", normalize_email(&contact.email))))?
                    .id,
            },
        };

        let reserved: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE ticket_categories
            SET booked_seats = booked_seats + $2
            WHERE id = $1 AND booked_seats + $2 <= total_seats
            RETURNING booked_seats
            "#,
        )
        .bind(category.id)
        .bind(request.quantity)
        .fetch_optional(&mut *tx)
        .await?;

        if reserved.is_none() {
            tx.rollback().await?;
            let available: i32 = sqlx::query_scalar(
                "SELECT GREATEST(total_seats - booked_seats, 0) FROM ticket_categories WHERE id = $1",
            )
            .bind(category.id)
            .fetch_one(&self.db.pool)
            .await?;
            debug!("Category {} sold out under contention, {} left", category.id, available);
            return Err(AppError::InsufficientInventory { available });
        }

        let total_price_cents = match mode {
            AssignmentMode::SpecificSeats => seats.iter().map(|s| s.price_cents).sum(),
            AssignmentMode::GenericInventory => category.default_price_cents * i64::from(request.quantity),
        };

        let booking_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO bookings (user_id, event_id, category_id, quantity, total_price_cents, status)
            VALUES ($1, $2, $3, $4, $5, 'PENDING')
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(request.event_id)
        .bind(category.id)
        .bind(request.quantity)
        .bind(total_price_cents)
        .fetch_one(&mut *tx)
        .await?;

        let seat_ids: Vec<i64> = seats.iter().map(|s| s.id).collect();

        let ticket_ids: Vec<i64> = match mode {
            AssignmentMode::SpecificSeats => {
                let locker = request.locker.as_ref().map(LockerId::as_str);
                let booked: Vec<i64> = sqlx::query_scalar(
                    r#"
                    UPDATE seats
                    SET status = 'BOOKED',
                        booking_id = $3,
                        locked_by = NULL,
                        lock_expires_at = NULL,
                        updated_at = NOW()
                    WHERE event_id = $1
                      AND id = ANY($2)
                      AND (
                            status = 'AVAILABLE'
                         OR (status = 'LOCKED' AND (lock_expires_at <= NOW() OR locked_by = $4))
                      )
                    RETURNING id
                    "#,
                )
                .bind(request.event_id)
                .bind(&seat_ids)
                .bind(booking_id)
                .bind(locker)
                .fetch_all(&mut *tx)
                .await?;

                if booked.len() != seat_ids.len() {
                    tx.rollback().await?;
                    let seats = current_availability(
                        &self.db.pool,
                        request.event_id,
                        &seat_ids,
                        request.locker.as_ref(),
                    )
                    .await?;
                    return Err(AppError::SeatLockConflict { seats });
                }

                sqlx::query(
                    "INSERT INTO booked_seats (booking_id, seat_id) SELECT $1, UNNEST($2::BIGINT[])",
                )
                .bind(booking_id)
                .bind(&seat_ids)
                .execute(&mut *tx)
                .await?;

                let prices: Vec<i64> = seats.iter().map(|s| s.price_cents).collect();
                sqlx::query_scalar(
                    r#"
                    INSERT INTO tickets (booking_id, category_id, seat_id, price_cents, status)
                    SELECT $1, $2, seat_id, price_cents, 'PENDING'
                    FROM UNNEST($3::BIGINT[], $4::BIGINT[]) AS t(seat_id, price_cents)
                    RETURNING id
                    "#,
                )
                .bind(booking_id)
                .bind(category.id)
                .bind(&seat_ids)
                .bind(&prices)
                .fetch_all(&mut *tx)
                .await?
            }
            AssignmentMode::GenericInventory => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO tickets (booking_id, category_id, seat_id, price_cents, status)
                    SELECT $1, $2, NULL, $3, 'PENDING'
                    FROM generate_series(1, $4)
                    RETURNING id
                    "#,
                )
                .bind(booking_id)
                .bind(category.id)
                .bind(category.default_price_cents)
                .bind(request.quantity)
                .fetch_all(&mut *tx)
                .await?
            }
        };

        let expires_at =
            ExpiryReconciler::schedule(&mut tx, booking_id, self.reservations.pending_hold_seconds).await?;

        tx.commit().await?;

        info!(
            "Booking {} created for user {}: {:?}, {} tickets, event {} category {}",
            booking_id,
            user_id,
            mode,
            ticket_ids.len(),
            request.event_id,
            category.id
        );

        Ok(CreatedBooking {
            booking_id,
            status: BookingStatus::Pending,
            mode,
            seat_ids,
            ticket_ids,
            total_price_cents,
            expires_at,
        })
    }

    /// Seat-mode resolution. No matching seat at all falls back to generic
    /// inventory; a partial match is an error.
    async fn resolve_seats(
        &self,
        category: &TicketCategory,
        seat_ids: &[i64],
        quantity: i32,
    ) -> Result<Vec<ResolvedSeat>> {
        let rows: Vec<(i64, Option<i64>, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT id, category_id, price_cents
            FROM seats
            WHERE event_id = $1 AND id = ANY($2)
            ORDER BY id
            "#,
        )
        .bind(category.event_id)
        .bind(seat_ids)
        .fetch_all(&self.db.pool)
        .await?;

        if rows.is_empty() {
            debug!(
                "No seats matched {:?} for event {}, booking by quantity",
                seat_ids, category.event_id
            );
            return Ok(Vec::new());
        }

        if rows.len() != seat_ids.len() {
            let missing: Vec<i64> = seat_ids
                .iter()
                .copied()
                .filter(|id| !rows.iter().any(|(found, _, _)| found == id))
                .collect();
            return Err(AppError::NotFound(format!(
                "Seats {missing:?} in event {}",
                category.event_id
            )));
        }

        if let Some((id, _, _)) = rows
            .iter()
            .find(|(_, seat_category, _)| seat_category.is_some_and(|c| c != category.id))
        {
            return Err(AppError::Validation(format!(
                "seat {id} does not belong to category {}",
                category.id
            )));
        }

        if rows.len() as i32 != quantity {
            return Err(AppError::Validation(format!(
                "quantity {quantity} does not match {} selected seats",
                rows.len()
            )));
        }

        Ok(rows
            .into_iter()
            .map(|(id, _, price)| ResolvedSeat {
                id,
                price_cents: price.unwrap_or(category.default_price_cents),
            })
            .collect())
    }

    async fn placeholder_password_hash(&self) -> Result<String> {
        let cost = self.reservations.guest_password_hash_cost;
        let placeholder = uuid::Uuid::new_v4().to_string();
        tokio::task::spawn_blocking(move || bcrypt::hash(placeholder, cost))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("hashing task failed: {e}")))?
            .map_err(|e| AppError::Internal(anyhow::anyhow!("hashing failed: {e}")))
    }

    /// PENDING → CONFIRMED, tickets → ACTIVE, seats → SOLD, and the booking is
    /// queued for ticket issuance. Confirming twice is a no-op.
    pub async fn confirm(&self, booking_id: i64) -> Result<TransitionOutcome> {
        let mut tx = self.db.begin().await?;

        let confirmed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE bookings
            SET status = 'CONFIRMED', updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING id
            "#,
        )
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?;

        if confirmed.is_none() {
            let status = booking_status(&mut tx, booking_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Booking {booking_id}")))?;
            tx.rollback().await?;
            return match status {
                BookingStatus::Confirmed => Ok(TransitionOutcome { booking_id, status, changed: false }),
                BookingStatus::Cancelled | BookingStatus::Refunded => Err(AppError::BookingCancelled(booking_id)),
                BookingStatus::Pending => Err(AppError::corrupt(format!(
                    "booking {booking_id} is pending but could not be confirmed"
                ))),
            };
        }

        sqlx::query("UPDATE tickets SET status = 'ACTIVE' WHERE booking_id = $1 AND status = 'PENDING'")
            .bind(booking_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE seats SET status = 'SOLD', updated_at = NOW() WHERE booking_id = $1 AND status = 'BOOKED'",
        )
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;

        ExpiryReconciler::settle(&mut tx, booking_id).await?;
        TicketQueue::enqueue(&mut tx, booking_id, self.tickets.max_attempts).await?;

        tx.commit().await?;

        info!("Booking {} confirmed, ticket issuance queued", booking_id);
        Ok(TransitionOutcome { booking_id, status: BookingStatus::Confirmed, changed: true })
    }

    /// Cancels a pending or confirmed booking. Cancelling an already cancelled
    /// booking succeeds without touching anything.
    pub async fn cancel(&self, booking_id: i64) -> Result<TransitionOutcome> {
        let mut tx = self.db.begin().await?;

        match cancel_in_tx(&mut tx, booking_id, CancelScope::Any).await? {
            CancelOutcome::Cancelled { released_seats, quantity } => {
                tx.commit().await?;
                info!(
                    "Booking {} cancelled: {} seats released, {} returned to inventory",
                    booking_id, released_seats, quantity
                );
                Ok(TransitionOutcome { booking_id, status: BookingStatus::Cancelled, changed: true })
            }
            CancelOutcome::Unchanged(status) => {
                tx.rollback().await?;
                Ok(TransitionOutcome { booking_id, status, changed: false })
            }
            CancelOutcome::NotFound => Err(AppError::NotFound(format!("Booking {booking_id}"))),
        }
    }

    pub async fn get(&self, booking_id: i64) -> Result<BookingDetails> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"
        ))
        .bind(booking_id)
        .fetch_optional(&self.db.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Booking {booking_id}")))?;
        let booking = Booking::try_from(row).map_err(AppError::corrupt)?;

        let seat_ids: Vec<i64> =
            sqlx::query_scalar("SELECT seat_id FROM booked_seats WHERE booking_id = $1 ORDER BY seat_id")
                .bind(booking_id)
                .fetch_all(&self.db.pool)
                .await?;

        let tickets = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT id, booking_id, seat_id, price_cents, status, qr_code, issued_at
            FROM tickets WHERE booking_id = $1 ORDER BY id
            "#,
        )
        .bind(booking_id)
        .fetch_all(&self.db.pool)
        .await?
        .into_iter()
        .map(|row| Ticket::try_from(row).map_err(AppError::corrupt))
        .collect::<Result<Vec<_>>>()?;

        Ok(BookingDetails { booking, seat_ids, tickets })
    }
}

async fn booking_status(tx: &mut Tx<'_>, booking_id: i64) -> Result<Option<BookingStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM bookings WHERE id = $1")
        .bind(booking_id)
        .fetch_optional(&mut **tx)
        .await?;

    status
        .map(|s| {
            BookingStatus::parse(&s)
                .ok_or_else(|| AppError::corrupt(format!("booking {booking_id} has unknown status {s}")))
        })
        .transpose()
}

/// Cancellation inside the caller's transaction, shared by explicit cancel and
/// the expiry sweep.
///
/// The status flip goes first: its conditional predicate decides which of two
/// concurrent cancellers (or a cancel racing a confirm) owns the transition.
/// Seats are released only when the booking has any, then the category
/// counter is given back.
pub async fn cancel_in_tx(tx: &mut Tx<'_>, booking_id: i64, scope: CancelScope) -> Result<CancelOutcome> {
    let from: &[&str] = match scope {
        CancelScope::PendingOnly => &["PENDING"],
        CancelScope::Any => &["PENDING", "CONFIRMED"],
    };

    let claimed: Option<(i64, i32)> = sqlx::query_as(
        r#"
        UPDATE bookings
        SET status = 'CANCELLED', updated_at = NOW()
        WHERE id = $1 AND status = ANY($2)
        RETURNING category_id, quantity
        "#,
    )
    .bind(booking_id)
    .bind(from)
    .fetch_optional(&mut **tx)
    .await?;

    let Some((category_id, quantity)) = claimed else {
        return Ok(match booking_status(tx, booking_id).await? {
            Some(status) => CancelOutcome::Unchanged(status),
            None => CancelOutcome::NotFound,
        });
    };

    let seat_ids: Vec<i64> = sqlx::query_scalar("SELECT seat_id FROM booked_seats WHERE booking_id = $1")
        .bind(booking_id)
        .fetch_all(&mut **tx)
        .await?;

    let mut released_seats = 0;
    if !seat_ids.is_empty() {
        released_seats = sqlx::query(
            r#"
            UPDATE seats
            SET status = 'AVAILABLE', booking_id = NULL, locked_by = NULL, lock_expires_at = NULL, updated_at = NOW()
            WHERE id = ANY($1) AND booking_id = $2 AND status IN ('BOOKED', 'SOLD')
            "#,
        )
        .bind(&seat_ids)
        .bind(booking_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if released_seats != seat_ids.len() as u64 {
            warn!(
                "Booking {} had {} seat links but {} seats were released",
                booking_id,
                seat_ids.len(),
                released_seats
            );
        }

        sqlx::query("DELETE FROM booked_seats WHERE booking_id = $1")
            .bind(booking_id)
            .execute(&mut **tx)
            .await?;
    }

    let restored = sqlx::query(
        r#"
        UPDATE ticket_categories
        SET booked_seats = booked_seats - $2
        WHERE id = $1 AND booked_seats >= $2
        "#,
    )
    .bind(category_id)
    .bind(quantity)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if restored == 0 {
        return Err(AppError::corrupt(format!(
            "category {category_id} counter is below the {quantity} held by booking {booking_id}"
        )));
    }

    sqlx::query("UPDATE tickets SET status = 'CANCELLED' WHERE booking_id = $1 AND status <> 'CANCELLED'")
        .bind(booking_id)
        .execute(&mut **tx)
        .await?;

    ExpiryReconciler::settle(tx, booking_id).await?;

    Ok(CancelOutcome::Cancelled { released_seats, quantity })
}

fn validate_guest(contact: &GuestContact) -> Result<()> {
    if !normalize_email(&contact.email).validate_email() {
        return Err(AppError::Validation(format!("invalid guest email {}", contact.email)));
    }
    Ok(())
}
