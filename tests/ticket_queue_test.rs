//! Ticket issuance queue integration tests: retries with backoff, permanent
//! failure, exclusive claims and stale-claim recovery.
//!
//! Run with: `cargo test --test ticket_queue_test -- --ignored` (Docker required)

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{guest, setup, setup_with, TestEnv};
use ticket_inventory::database::Database;
use ticket_inventory::models::QueueStatus;
use ticket_inventory::services::bookings::CreateBooking;
use ticket_inventory::services::tickets::{IssueOutcome, QrTicketIssuer, TicketIssuer, TicketWorker};

/// Fails the first `failures` calls, then succeeds.
struct FlakyIssuer {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyIssuer {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self { failures, calls: AtomicU32::new(0) })
    }
}

#[async_trait]
impl TicketIssuer for FlakyIssuer {
    async fn issue(&self, _db: &Database, _booking_id: i64) -> anyhow::Result<IssueOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("issuer unavailable (call {call})");
        }
        Ok(IssueOutcome::Issued(1))
    }
}

async fn confirmed_booking(env: &TestEnv, email: &str) -> i64 {
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 10, 1000).await;
    let created = env
        .state
        .bookings
        .create(CreateBooking {
            event_id,
            category_id,
            quantity: 2,
            seat_ids: None,
            locker: None,
            purchaser: guest(email),
        })
        .await
        .unwrap();
    env.state.bookings.confirm(created.booking_id).await.unwrap();
    created.booking_id
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn transient_failures_are_retried_until_done() {
    let env = setup().await;
    let booking_id = confirmed_booking(&env, "retry@example.com").await;
    let issuer = FlakyIssuer::new(2);
    let worker = TicketWorker::new(env.db.clone(), env.state.tickets.clone(), issuer.clone());

    let first = worker.process_batch().await.unwrap();
    assert_eq!((first.claimed, first.retried), (1, 1));

    let entry = env.state.tickets.find_by_booking(booking_id).await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.attempts, 1);
    assert!(entry.error.as_deref().is_some_and(|e| e.contains("issuer unavailable")));

    // Backoff keeps the entry out of reach until it is due
    assert_eq!(worker.process_batch().await.unwrap().claimed, 0);

    env.make_ticket_entries_due().await;
    worker.process_batch().await.unwrap();
    env.make_ticket_entries_due().await;
    let last = worker.process_batch().await.unwrap();
    assert_eq!(last.completed, 1);

    let entry = env.state.tickets.find_by_booking(booking_id).await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Done);
    assert_eq!(entry.attempts, 2);
    assert!(entry.error.is_none());
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn exhausted_entry_is_parked_as_failed() {
    let env = setup().await;
    let booking_id = confirmed_booking(&env, "doomed@example.com").await;
    let issuer = FlakyIssuer::new(u32::MAX);
    let worker = TicketWorker::new(env.db.clone(), env.state.tickets.clone(), issuer.clone());

    for _ in 0..3 {
        env.make_ticket_entries_due().await;
        worker.process_batch().await.unwrap();
    }

    let entry = env.state.tickets.find_by_booking(booking_id).await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.attempts, 3);

    // Failed entries are never claimed again
    env.make_ticket_entries_due().await;
    assert_eq!(worker.process_batch().await.unwrap().claimed, 0);
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 3);

    let stats = env.state.tickets.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_claims_hand_out_each_entry_once() {
    let env = setup().await;
    for i in 0..6 {
        confirmed_booking(&env, &format!("claim{i}@example.com")).await;
    }

    let (a, b) = tokio::join!(env.state.tickets.claim_due(10), env.state.tickets.claim_due(10));
    let mut ids: Vec<i64> = a.unwrap().into_iter().chain(b.unwrap()).map(|e| e.id).collect();
    ids.sort_unstable();
    let total = ids.len();
    ids.dedup();

    assert_eq!(total, 6);
    assert_eq!(ids.len(), 6);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn stale_claim_is_reclaimed_and_old_owner_is_fenced_off() {
    let env = setup_with(&[("TICKET_CLAIM_TIMEOUT_SECONDS", "1")]).await;
    let booking_id = confirmed_booking(&env, "crash@example.com").await;

    let stale = env.state.tickets.claim_due(10).await.unwrap().remove(0);
    assert_eq!(stale.status, QueueStatus::Processing);

    // Nothing to claim while the first claim is fresh
    assert!(env.state.tickets.claim_due(10).await.unwrap().is_empty());

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let fresh = env.state.tickets.claim_due(10).await.unwrap().remove(0);
    assert_eq!(fresh.booking_id, booking_id);
    assert!(fresh.version > stale.version);
    assert_eq!(fresh.attempts, 1);

    assert!(!env.state.tickets.complete(&stale).await.unwrap());
    assert_eq!(env.state.tickets.fail(&stale, "late").await.unwrap(), None);
    assert!(env.state.tickets.complete(&fresh).await.unwrap());

    let entry = env.state.tickets.find_by_booking(booking_id).await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Done);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn issued_tickets_carry_signed_qr_codes() {
    let env = setup().await;
    let booking_id = confirmed_booking(&env, "qr@example.com").await;
    let issuer = Arc::new(QrTicketIssuer::new("test-secret"));
    let worker = TicketWorker::new(env.db.clone(), env.state.tickets.clone(), issuer);

    let report = worker.process_batch().await.unwrap();
    assert_eq!(report.completed, 1);

    let details = env.state.bookings.get(booking_id).await.unwrap();
    assert_eq!(details.tickets.len(), 2);
    for ticket in &details.tickets {
        let qr = ticket.qr_code.as_deref().expect("ticket has a QR code");
        assert!(qr.starts_with(&format!("{booking_id}.{}.", ticket.id)));
        assert!(ticket.issued_at.is_some());
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn booking_cancelled_before_issuance_gets_no_tickets() {
    let env = setup().await;
    let booking_id = confirmed_booking(&env, "refund@example.com").await;
    env.state.bookings.cancel(booking_id).await.unwrap();

    let issuer = Arc::new(QrTicketIssuer::new("test-secret"));
    let worker = TicketWorker::new(env.db.clone(), env.state.tickets.clone(), issuer);
    let report = worker.process_batch().await.unwrap();
    assert_eq!(report.completed, 1);

    let details = env.state.bookings.get(booking_id).await.unwrap();
    assert!(details.tickets.iter().all(|t| t.qr_code.is_none()));
    assert_eq!(
        env.state.tickets.find_by_booking(booking_id).await.unwrap().unwrap().status,
        QueueStatus::Done
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn entry_whose_workers_keep_dying_ends_failed() {
    let env = setup().await;
    let booking_id = confirmed_booking(&env, "poison@example.com").await;

    let first = env.state.tickets.claim_due(10).await.unwrap().remove(0);
    assert_eq!(first.attempts, 0);

    env.expire_ticket_claims().await;
    let second = env.state.tickets.claim_due(10).await.unwrap().remove(0);
    assert_eq!(second.attempts, 1);

    env.expire_ticket_claims().await;
    let third = env.state.tickets.claim_due(10).await.unwrap().remove(0);
    assert_eq!(third.attempts, 2);

    // The third lost attempt uses up max_attempts = 3
    env.expire_ticket_claims().await;
    assert!(env.state.tickets.claim_due(10).await.unwrap().is_empty());

    let entry = env.state.tickets.find_by_booking(booking_id).await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.attempts, 3);
    assert!(entry.error.as_deref().is_some_and(|e| e.contains("timed out")));

    // Parked for good, and the last holder cannot revive it
    env.expire_ticket_claims().await;
    env.make_ticket_entries_due().await;
    assert!(env.state.tickets.claim_due(10).await.unwrap().is_empty());
    assert!(!env.state.tickets.complete(&third).await.unwrap());
    assert_eq!(env.state.tickets.stats().await.unwrap().failed, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unreadable_entry_is_reported_not_hidden() {
    let env = setup().await;
    let booking_id = confirmed_booking(&env, "corrupt@example.com").await;

    sqlx::query("ALTER TABLE ticket_generation_queue DROP CONSTRAINT ticket_generation_queue_status_check")
        .execute(&env.db.pool)
        .await
        .unwrap();
    sqlx::query("UPDATE ticket_generation_queue SET status = 'mangled' WHERE booking_id = $1")
        .bind(booking_id)
        .execute(&env.db.pool)
        .await
        .unwrap();

    let err = env.state.tickets.find_by_booking(booking_id).await.unwrap_err();
    assert!(matches!(err, sqlx::Error::Decode(_)));
    assert!(env.state.tickets.find_by_booking(booking_id + 1000).await.unwrap().is_none());
}
