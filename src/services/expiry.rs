use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::ReservationConfig;
use crate::database::{Database, Tx};
use crate::models::ReservationExpiryEntry;
use crate::services::bookings::{cancel_in_tx, CancelOutcome, CancelScope};
use crate::services::seats::sweep_expired_locks;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    /// Bookings still pending at expiry, now cancelled.
    pub cancelled: usize,
    /// Bookings that had already been confirmed or cancelled.
    pub settled: usize,
    pub errors: usize,
    pub seats_reclaimed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReservationQueueStats {
    pub unprocessed: i64,
    pub due: i64,
}

/// Reclaims abandoned holds: pending bookings past their hold window and seat
/// locks whose TTL lapsed on events nobody is reading.
#[derive(Clone)]
pub struct ExpiryReconciler {
    db: Database,
    config: ReservationConfig,
}

impl ExpiryReconciler {
    pub fn new(db: Database, config: ReservationConfig) -> Self {
        Self { db, config }
    }

    /// Registers the hold window of a freshly created pending booking.
    pub async fn schedule(tx: &mut Tx<'_>, booking_id: i64, hold_seconds: i64) -> Result<DateTime<Utc>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            INSERT INTO reservation_expiry_queue (booking_id, expires_at)
            VALUES ($1, NOW() + ($2::BIGINT * INTERVAL '1 second'))
            ON CONFLICT (booking_id) DO UPDATE SET expires_at = EXCLUDED.expires_at
            RETURNING expires_at
            "#,
        )
        .bind(booking_id)
        .bind(hold_seconds)
        .fetch_one(&mut **tx)
        .await
    }

    /// The booking left PENDING; its expiry row no longer has work to do.
    pub async fn settle(tx: &mut Tx<'_>, booking_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE reservation_expiry_queue
            SET processed = TRUE, processed_at = NOW()
            WHERE booking_id = $1 AND processed = FALSE
            "#,
        )
        .bind(booking_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.sweep_interval_seconds);
        info!("⏱️ Reservation expiry reconciler started");

        loop {
            match self.run_once().await {
                Ok(report) if report.due > 0 || report.seats_reclaimed > 0 => info!(
                    "⏱️ Expiry sweep: {} due, {} cancelled, {} already settled, {} errors, {} lapsed seat locks",
                    report.due, report.cancelled, report.settled, report.errors, report.seats_reclaimed
                ),
                Ok(_) => debug!("⏱️ Nothing expired"),
                Err(e) => error!("⏱️ Expiry sweep failed: {:?}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("⏱️ Reservation expiry reconciler stopped");
    }

    pub async fn run_once(&self) -> anyhow::Result<SweepReport> {
        let mut report = self.process_due().await?;
        report.seats_reclaimed = self.sweep_lapsed_locks().await?;
        Ok(report)
    }

    /// Handles every due expiry row, each in its own transaction.
    pub async fn process_due(&self) -> anyhow::Result<SweepReport> {
        let due = sqlx::query_as::<_, ReservationExpiryEntry>(
            r#"
            SELECT id, booking_id, expires_at, processed
            FROM reservation_expiry_queue
            WHERE processed = FALSE AND expires_at <= NOW()
            ORDER BY expires_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(self.config.sweep_batch)
        .fetch_all(&self.db.pool)
        .await?;

        let mut report = SweepReport { due: due.len(), ..SweepReport::default() };

        for entry in due {
            match self.expire(&entry).await {
                Ok(Some(CancelOutcome::Cancelled { released_seats, quantity })) => {
                    info!(
                        "⏱️ Booking {} expired: {} seats released, {} returned to inventory",
                        entry.booking_id, released_seats, quantity
                    );
                    report.cancelled += 1;
                }
                Ok(Some(_)) => report.settled += 1,
                // another reconciler got there first
                Ok(None) => {}
                Err(e) => {
                    error!("⏱️ Failed to expire booking {}: {:?}", entry.booking_id, e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    async fn expire(&self, entry: &ReservationExpiryEntry) -> anyhow::Result<Option<CancelOutcome>> {
        let mut tx = self.db.begin().await?;

        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE reservation_expiry_queue
            SET processed = TRUE, processed_at = NOW()
            WHERE id = $1 AND processed = FALSE AND expires_at <= NOW()
            RETURNING booking_id
            "#,
        )
        .bind(entry.id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(booking_id) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let outcome = cancel_in_tx(&mut tx, booking_id, CancelScope::PendingOnly).await?;
        tx.commit().await?;
        Ok(Some(outcome))
    }

    /// Opportunistic sweep for every event that has lapsed locks, one event
    /// at a time.
    pub async fn sweep_lapsed_locks(&self) -> anyhow::Result<u64> {
        let event_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT event_id FROM seats WHERE status = 'LOCKED' AND lock_expires_at <= NOW()",
        )
        .fetch_all(&self.db.pool)
        .await?;

        let mut reclaimed = 0;
        for event_id in event_ids {
            match sweep_expired_locks(&self.db.pool, event_id).await {
                Ok(n) => reclaimed += n,
                Err(e) => error!("⏱️ Failed to sweep locks for event {}: {:?}", event_id, e),
            }
        }
        Ok(reclaimed)
    }

    pub async fn stats(&self) -> Result<ReservationQueueStats, sqlx::Error> {
        let (unprocessed, due): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE processed = FALSE),
                   COUNT(*) FILTER (WHERE processed = FALSE AND expires_at <= NOW())
            FROM reservation_expiry_queue
            "#,
        )
        .fetch_one(&self.db.pool)
        .await?;

        Ok(ReservationQueueStats { unprocessed, due })
    }
}
