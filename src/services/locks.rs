//! Short-TTL seat holds.
//!
//! Acquisition is optimistic: a single conditional `UPDATE` takes every
//! requested seat that is free, lapsed, or already held by the same locker.
//! If fewer rows change than were requested the transaction is dropped
//! uncommitted and the caller gets the seats' current state back. No row is
//! kept locked beyond the transaction itself.
//!
//! The per-locker cap is a count followed by the update, so calls from the
//! same locker on the same event take a transaction-scoped advisory lock
//! first. Different lockers never wait on each other.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::LockConfig;
use crate::database::Database;
use crate::error::{AppError, Result};
use crate::middleware::LockerId;
use crate::models::Event;
use crate::services::seats::current_availability;

const MAX_SEATS_PER_REQUEST: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct LockGrant {
    pub seat_ids: Vec<i64>,
    pub locker_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct UnlockOutcome {
    pub released_count: u64,
}

/// Sorted, de-duplicated seat ids. Rejects empty or non-positive input.
pub fn normalize_seat_ids(seat_ids: &[i64]) -> Result<Vec<i64>> {
    if seat_ids.is_empty() {
        return Err(AppError::Validation("seat_ids must not be empty".to_string()));
    }
    if let Some(bad) = seat_ids.iter().find(|id| **id <= 0) {
        return Err(AppError::Validation(format!("seat id {bad} must be > 0")));
    }

    let mut ids = seat_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    if ids.len() > MAX_SEATS_PER_REQUEST {
        return Err(AppError::Validation(format!(
            "at most {MAX_SEATS_PER_REQUEST} seats per request"
        )));
    }
    Ok(ids)
}

/// Requested TTL, defaulted and capped at the configured ceiling.
pub fn resolve_ttl(requested: Option<i64>, config: &LockConfig) -> Result<i64> {
    match requested {
        None => Ok(config.default_ttl_seconds),
        Some(ttl) if ttl < 1 => Err(AppError::Validation("ttl_seconds must be >= 1".to_string())),
        Some(ttl) => Ok(ttl.min(config.max_ttl_seconds)),
    }
}

/// `active` counts the locker's live holds outside the current request.
pub fn check_lock_limit(active: i64, requested: i64, max: i64) -> Result<()> {
    if active + requested > max {
        return Err(AppError::SeatLockLimitExceeded { max, active, requested });
    }
    Ok(())
}

#[derive(Clone)]
pub struct LockManager {
    db: Database,
    config: LockConfig,
}

impl LockManager {
    pub fn new(db: Database, config: LockConfig) -> Self {
        Self { db, config }
    }

    pub async fn lock(
        &self,
        event_id: i64,
        seat_ids: &[i64],
        locker: &LockerId,
        ttl_seconds: Option<i64>,
    ) -> Result<LockGrant> {
        let seat_ids = normalize_seat_ids(seat_ids)?;
        let ttl = resolve_ttl(ttl_seconds, &self.config)?;

        Event::find(&self.db.pool, event_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Event {event_id}")))?;

        let mut tx = self.db.begin().await?;

        // Same-locker calls on one event queue here until the holder commits,
        // so the count below always sees the previous grant.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::BIGINT::TEXT || ':' || $2))")
            .bind(event_id)
            .bind(locker.as_str())
            .execute(&mut *tx)
            .await?;

        let active: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM seats
            WHERE event_id = $1
              AND status = 'LOCKED'
              AND locked_by = $2
              AND lock_expires_at > NOW()
              AND id <> ALL($3)
            "#,
        )
        .bind(event_id)
        .bind(locker.as_str())
        .bind(&seat_ids)
        .fetch_one(&mut *tx)
        .await?;

        check_lock_limit(active, seat_ids.len() as i64, self.config.max_seats_per_locker)?;

        let granted: Vec<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE seats
            SET status = 'LOCKED',
                locked_by = $3,
                lock_expires_at = NOW() + ($4::BIGINT * INTERVAL '1 second'),
                updated_at = NOW()
            WHERE event_id = $1
              AND id = ANY($2)
              AND (
                    status = 'AVAILABLE'
                 OR (status = 'LOCKED' AND (lock_expires_at <= NOW() OR locked_by = $3))
              )
            RETURNING lock_expires_at
            "#,
        )
        .bind(event_id)
        .bind(&seat_ids)
        .bind(locker.as_str())
        .bind(ttl)
        .fetch_all(&mut *tx)
        .await?;

        if granted.len() != seat_ids.len() {
            tx.rollback().await?;
            let seats = current_availability(&self.db.pool, event_id, &seat_ids, Some(locker)).await?;
            debug!(
                "Seat lock conflict for {} on event {}: got {} of {}",
                locker,
                event_id,
                granted.len(),
                seat_ids.len()
            );
            return Err(AppError::SeatLockConflict { seats });
        }

        tx.commit().await?;

        let expires_at = granted
            .into_iter()
            .max()
            .ok_or_else(|| AppError::corrupt("lock granted no seats".to_string()))?;

        info!(
            "Locked {} seats on event {} for {} until {}",
            seat_ids.len(),
            event_id,
            locker,
            expires_at
        );

        Ok(LockGrant {
            seat_ids,
            locker_id: locker.to_string(),
            expires_at,
        })
    }

    /// Releases the caller's live holds among `seat_ids`. Anything not held by
    /// the caller is ignored.
    pub async fn unlock(&self, event_id: i64, seat_ids: &[i64], locker: &LockerId) -> Result<UnlockOutcome> {
        let seat_ids = normalize_seat_ids(seat_ids)?;

        let released_count = sqlx::query(
            r#"
            UPDATE seats
            SET status = 'AVAILABLE', locked_by = NULL, lock_expires_at = NULL, updated_at = NOW()
            WHERE event_id = $1
              AND id = ANY($2)
              AND status = 'LOCKED'
              AND locked_by = $3
              AND lock_expires_at > NOW()
            "#,
        )
        .bind(event_id)
        .bind(&seat_ids)
        .bind(locker.as_str())
        .execute(&self.db.pool)
        .await?
        .rows_affected();

        debug!(
            "Unlocked {} of {} requested seats on event {} for {}",
            released_count,
            seat_ids.len(),
            event_id,
            locker
        );

        Ok(UnlockOutcome { released_count })
    }
}
