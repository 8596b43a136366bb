//! tickets.rs
//!
//! Durable outbox for post-confirmation ticket issuance.
//!
//! 1.  **TicketQueue**: enqueue / claim / complete / fail over the
//!     `ticket_generation_queue` table. A claim is a single conditional update
//!     that flips `pending` rows to `processing` and bumps `version`; only the
//!     rows it actually changed are handed to the caller, so two workers never
//!     own the same entry. `complete`/`fail` apply only at the claimed version.
//! 2.  **TicketIssuer**: the side effect itself (signed QR payloads for the
//!     booking's active tickets).
//! 3.  **TicketWorker**: the polling loop that drains the queue.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures::StreamExt;
use serde::Serialize;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::TicketQueueConfig;
use crate::database::{Database, Tx};
use crate::models::queue::TicketGenerationRow;
use crate::models::{BookingStatus, QueueStatus, TicketGenerationEntry};

/// Recorded on an entry whose worker never reported back.
const CLAIM_TIMED_OUT: &str = "claim timed out before the attempt finished";

const ENTRY_COLUMNS: &str =
    "id, booking_id, status, attempts, max_attempts, next_attempt_at, version, error";

/// Delay before the next attempt, `attempts` being the count including the
/// failure just recorded. Doubles from `base` up to `max`.
pub fn backoff_seconds(attempts: i32, base: i64, max: i64) -> i64 {
    let exponent = (attempts.max(1) - 1).min(30) as u32;
    base.saturating_mul(1i64 << exponent).min(max)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TicketQueueStats {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct TicketQueue {
    db: Database,
    config: TicketQueueConfig,
}

impl TicketQueue {
    pub fn new(db: Database, config: TicketQueueConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &TicketQueueConfig {
        &self.config
    }

    /// Adds the booking to the queue inside the caller's transaction. A booking
    /// is queued at most once.
    pub async fn enqueue(tx: &mut Tx<'_>, booking_id: i64, max_attempts: i32) -> Result<bool, sqlx::Error> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO ticket_generation_queue (booking_id, status, attempts, max_attempts, next_attempt_at)
            VALUES ($1, 'pending', 0, $2, NOW())
            ON CONFLICT (booking_id) DO NOTHING
            "#,
        )
        .bind(booking_id)
        .bind(max_attempts)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        Ok(inserted > 0)
    }

    /// Claims up to `limit` due entries, oldest-due and least-retried first.
    ///
    /// An entry stuck in `processing` past the claim timeout lost its worker
    /// mid-attempt. Taking it over counts that attempt, and an entry whose
    /// attempts run out this way is parked as `failed` instead of handed out.
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<TicketGenerationEntry>, sqlx::Error> {
        let query = r#"
            WITH candidates AS (
                SELECT id
                FROM ticket_generation_queue
                WHERE (status = 'pending' AND next_attempt_at <= NOW())
                   OR (status = 'processing' AND claimed_at <= NOW() - ($2::BIGINT * INTERVAL '1 second'))
                ORDER BY next_attempt_at ASC, attempts ASC, id ASC
                LIMIT $1
            )
            UPDATE ticket_generation_queue q
            SET attempts = CASE WHEN q.status = 'processing' THEN q.attempts + 1 ELSE q.attempts END,
                status = CASE
                    WHEN q.status = 'processing' AND q.attempts + 1 >= q.max_attempts THEN 'failed'
                    ELSE 'processing'
                END,
                error = CASE WHEN q.status = 'processing' THEN $3 ELSE q.error END,
                version = q.version + 1,
                claimed_at = NOW(),
                updated_at = NOW()
            FROM candidates c
            WHERE q.id = c.id
              AND (
                    (q.status = 'pending' AND q.next_attempt_at <= NOW())
                 OR (q.status = 'processing' AND q.claimed_at <= NOW() - ($2::BIGINT * INTERVAL '1 second'))
              )
            RETURNING q.id, q.booking_id, q.status, q.attempts, q.max_attempts,
                      q.next_attempt_at, q.version, q.error
            "#;

        let rows = sqlx::query_as::<_, TicketGenerationRow>(query)
            .bind(limit)
            .bind(self.config.claim_timeout_seconds)
            .bind(CLAIM_TIMED_OUT)
            .fetch_all(&self.db.pool)
            .await?;

        let mut entries: Vec<TicketGenerationEntry> = rows
            .into_iter()
            .filter_map(|row| match TicketGenerationEntry::try_from(row) {
                Ok(entry) if entry.status == QueueStatus::Failed => {
                    error!(
                        "Ticket issuance for booking {} failed permanently: {} after {} attempts",
                        entry.booking_id, CLAIM_TIMED_OUT, entry.attempts
                    );
                    None
                }
                Ok(entry) => Some(entry),
                Err(e) => {
                    error!("Skipping unreadable ticket queue row: {}", e);
                    None
                }
            })
            .collect();

        // UPDATE ... RETURNING does not preserve the CTE order
        entries.sort_by(|a, b| {
            a.next_attempt_at
                .cmp(&b.next_attempt_at)
                .then(a.attempts.cmp(&b.attempts))
                .then(a.id.cmp(&b.id))
        });

        Ok(entries)
    }

    /// Marks a claimed entry done. Returns false when the claim was superseded.
    pub async fn complete(&self, entry: &TicketGenerationEntry) -> Result<bool, sqlx::Error> {
        let updated = sqlx::query(
            r#"
            UPDATE ticket_generation_queue
            SET status = 'done', error = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND version = $2
            "#,
        )
        .bind(entry.id)
        .bind(entry.version)
        .execute(&self.db.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    /// Records a failed attempt and schedules the retry, or parks the entry as
    /// `failed` once its attempts are used up. Returns the resulting status, or
    /// `None` when the claim was superseded.
    pub async fn fail(&self, entry: &TicketGenerationEntry, error: &str) -> Result<Option<QueueStatus>, sqlx::Error> {
        let delay = backoff_seconds(
            entry.attempts + 1,
            self.config.backoff_base_seconds,
            self.config.backoff_max_seconds,
        );

        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE ticket_generation_queue
            SET attempts = attempts + 1,
                error = $3,
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                next_attempt_at = NOW() + ($4::BIGINT * INTERVAL '1 second'),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND version = $2
            RETURNING status
            "#,
        )
        .bind(entry.id)
        .bind(entry.version)
        .bind(error)
        .bind(delay)
        .fetch_optional(&self.db.pool)
        .await?;

        Ok(status.as_deref().and_then(QueueStatus::parse))
    }

    pub async fn find_by_booking(&self, booking_id: i64) -> Result<Option<TicketGenerationEntry>, sqlx::Error> {
        let row = sqlx::query_as::<_, TicketGenerationRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ticket_generation_queue WHERE booking_id = $1"
        ))
        .bind(booking_id)
        .fetch_optional(&self.db.pool)
        .await?;

        row.map(|r| TicketGenerationEntry::try_from(r).map_err(|e| sqlx::Error::Decode(e.into())))
            .transpose()
    }

    pub async fn stats(&self) -> Result<TicketQueueStats, sqlx::Error> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM ticket_generation_queue GROUP BY status",
        )
        .fetch_all(&self.db.pool)
        .await?;

        let mut stats = TicketQueueStats::default();
        for (status, count) in rows {
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Pending) => stats.pending = count,
                Some(QueueStatus::Processing) => stats.processing = count,
                Some(QueueStatus::Done) => stats.done = count,
                Some(QueueStatus::Failed) => stats.failed = count,
                None => warn!("Unknown ticket queue status {}", status),
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    Issued(u64),
    /// Booking no longer confirmed; nothing to issue.
    Skipped,
}

#[async_trait]
pub trait TicketIssuer: Send + Sync {
    async fn issue(&self, db: &Database, booking_id: i64) -> anyhow::Result<IssueOutcome>;
}

type HmacSha256 = Hmac<Sha256>;

/// Signed payload printed into a ticket's QR code: HMAC-SHA256 over the
/// booking and ticket ids, base64url encoded.
pub fn sign_ticket(secret: &str, booking_id: i64, ticket_id: i64) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow::anyhow!("ticket signing key rejected"))?;
    mac.update(format!("{booking_id}:{ticket_id}").as_bytes());
    let signature = general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{booking_id}.{ticket_id}.{signature}"))
}

pub struct QrTicketIssuer {
    secret: String,
}

impl QrTicketIssuer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

#[async_trait]
impl TicketIssuer for QrTicketIssuer {
    async fn issue(&self, db: &Database, booking_id: i64) -> anyhow::Result<IssueOutcome> {
        let mut tx = db.begin().await?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM bookings WHERE id = $1")
            .bind(booking_id)
            .fetch_optional(&mut *tx)
            .await?;

        if status.as_deref() != Some(BookingStatus::Confirmed.as_str()) {
            return Ok(IssueOutcome::Skipped);
        }

        let ticket_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM tickets WHERE booking_id = $1 AND status = 'ACTIVE' AND qr_code IS NULL ORDER BY id",
        )
        .bind(booking_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut issued = 0;
        for ticket_id in ticket_ids {
            issued += sqlx::query(
                r#"
                UPDATE tickets
                SET qr_code = $2, issued_at = NOW()
                WHERE id = $1 AND status = 'ACTIVE' AND qr_code IS NULL
                "#,
            )
            .bind(ticket_id)
            .bind(sign_ticket(&self.secret, booking_id, ticket_id)?)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(IssueOutcome::Issued(issued))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct TicketWorker {
    db: Database,
    queue: TicketQueue,
    issuer: Arc<dyn TicketIssuer>,
}

impl TicketWorker {
    pub fn new(db: Database, queue: TicketQueue, issuer: Arc<dyn TicketIssuer>) -> Self {
        Self { db, queue, issuer }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_secs(self.queue.config().poll_interval_seconds);
        info!("🎟️ Ticket issuance worker started");

        loop {
            let worked = match self.process_batch().await {
                Ok(report) if report.claimed > 0 => {
                    info!(
                        "🎟️ Ticket batch: claimed {}, done {}, retry {}, failed {}",
                        report.claimed, report.completed, report.retried, report.failed
                    );
                    true
                }
                Ok(_) => {
                    debug!("🎟️ No ticket work due");
                    false
                }
                Err(e) => {
                    error!("🎟️ Ticket batch failed: {:?}", e);
                    false
                }
            };

            if worked {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("🎟️ Ticket issuance worker stopped");
    }

    pub async fn process_batch(&self) -> anyhow::Result<BatchReport> {
        let config = self.queue.config();
        let entries = self.queue.claim_due(config.batch_size).await?;
        let claimed = entries.len();

        let outcomes: Vec<Option<QueueStatus>> = futures::stream::iter(entries)
            .map(|entry| async move { self.process_entry(entry).await })
            .buffer_unordered(config.worker_concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport { claimed, ..BatchReport::default() };
        for outcome in outcomes {
            match outcome {
                Some(QueueStatus::Done) => report.completed += 1,
                Some(QueueStatus::Pending) => report.retried += 1,
                Some(QueueStatus::Failed) => report.failed += 1,
                _ => {}
            }
        }
        Ok(report)
    }

    async fn process_entry(&self, entry: TicketGenerationEntry) -> Option<QueueStatus> {
        match self.issuer.issue(&self.db, entry.booking_id).await {
            Ok(outcome) => {
                if outcome == IssueOutcome::Skipped {
                    debug!("Booking {} is not confirmed, nothing to issue", entry.booking_id);
                }
                match self.queue.complete(&entry).await {
                    Ok(true) => Some(QueueStatus::Done),
                    Ok(false) => {
                        warn!("Ticket entry {} was reclaimed before completion", entry.id);
                        None
                    }
                    Err(e) => {
                        error!("Failed to complete ticket entry {}: {:?}", entry.id, e);
                        None
                    }
                }
            }
            Err(issue_error) => {
                let message = format!("{issue_error:#}");
                match self.queue.fail(&entry, &message).await {
                    Ok(Some(QueueStatus::Failed)) => {
                        error!(
                            "Ticket issuance for booking {} failed permanently after {} attempts: {}",
                            entry.booking_id,
                            entry.attempts + 1,
                            message
                        );
                        Some(QueueStatus::Failed)
                    }
                    Ok(Some(status)) => {
                        warn!(
                            "Ticket issuance for booking {} failed (attempt {}), retry scheduled: {}",
                            entry.booking_id,
                            entry.attempts + 1,
                            message
                        );
                        Some(status)
                    }
                    Ok(None) => {
                        warn!("Ticket entry {} was reclaimed before failure was recorded", entry.id);
                        None
                    }
                    Err(e) => {
                        error!("Failed to record failure of ticket entry {}: {:?}", entry.id, e);
                        None
                    }
                }
            }
        }
    }
}
