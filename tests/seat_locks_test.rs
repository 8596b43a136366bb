//! Seat lock integration tests: mutual exclusion, per-locker cap, idempotent
//! unlock and TTL reclamation against a real PostgreSQL.
//!
//! Run with: `cargo test --test seat_locks_test -- --ignored` (Docker required)

mod common;

use chrono::{Duration, Utc};
use common::{guest_locker, setup, setup_with};
use ticket_inventory::error::AppError;
use ticket_inventory::models::SeatStatus;

#[tokio::test]
#[ignore = "requires Docker"]
async fn lock_grants_ttl_and_conflicting_locker_sees_current_status() {
    let env = setup().await;
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 10, 5000).await;
    let seats = env.create_seats(event_id, category_id, 3).await;
    let (s1, s2, s3) = (seats[0], seats[1], seats[2]);

    let l1 = guest_locker("l1");
    let l2 = guest_locker("l2");

    let grant = env.state.locks.lock(event_id, &[s1, s2], &l1, Some(300)).await.unwrap();
    let expected = Utc::now() + Duration::seconds(300);
    assert!((grant.expires_at - expected).num_seconds().abs() <= 5);
    assert_eq!(grant.seat_ids, vec![s1, s2]);

    let err = env.state.locks.lock(event_id, &[s2, s3], &l2, None).await.unwrap_err();
    match err {
        AppError::SeatLockConflict { seats } => {
            assert_eq!(seats.len(), 2);
            assert_eq!(seats[0].seat_id, s2);
            assert_eq!(seats[0].status, SeatStatus::Locked);
            assert!(!seats[0].held_by_requester);
            assert_eq!(seats[1].seat_id, s3);
            assert_eq!(seats[1].status, SeatStatus::Available);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    // The failed attempt must not leave S3 half-locked
    assert_eq!(env.seat_status(s3).await, ("AVAILABLE".to_string(), None));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_lockers_never_share_a_seat() {
    let env = setup().await;
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 10, 5000).await;
    let seat = env.create_seats(event_id, category_id, 1).await[0];

    let mut handles = Vec::new();
    for i in 0..16 {
        let state = env.state.clone();
        handles.push(tokio::spawn(async move {
            let locker = guest_locker(&format!("racer-{i}"));
            state.locks.lock(event_id, &[seat], &locker, Some(60)).await
        }));
    }

    let results = futures::future::join_all(handles).await;

    let mut granted = 0;
    for result in results {
        match result.expect("Task panicked") {
            Ok(_) => granted += 1,
            Err(AppError::SeatLockConflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(granted, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn locker_cap_applies_across_separate_calls() {
    let env = setup().await;
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 10, 5000).await;
    let seats = env.create_seats(event_id, category_id, 6).await;
    let locker = guest_locker("collector");

    env.state.locks.lock(event_id, &seats[0..2], &locker, None).await.unwrap();
    env.state.locks.lock(event_id, &seats[2..4], &locker, None).await.unwrap();

    // Re-locking seats already held does not count twice
    env.state.locks.lock(event_id, &seats[0..4], &locker, None).await.unwrap();

    let err = env.state.locks.lock(event_id, &seats[4..5], &locker, None).await.unwrap_err();
    match err {
        AppError::SeatLockLimitExceeded { max, active, requested } => {
            assert_eq!(max, 4);
            assert_eq!(active, 4);
            assert_eq!(requested, 1);
        }
        other => panic!("expected lock limit, got {other:?}"),
    }

    assert_eq!(env.seat_status(seats[4]).await.0, "AVAILABLE");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn locker_cap_holds_under_concurrent_calls() {
    let env = setup().await;
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 20, 5000).await;
    let seats = env.create_seats(event_id, category_id, 12).await;

    let mut handles = Vec::new();
    for seat in seats {
        let state = env.state.clone();
        handles.push(tokio::spawn(async move {
            state.locks.lock(event_id, &[seat], &guest_locker("greedy"), None).await
        }));
    }
    let results = futures::future::join_all(handles).await;

    let mut granted = 0;
    for result in results {
        match result.expect("Task panicked") {
            Ok(_) => granted += 1,
            Err(AppError::SeatLockLimitExceeded { max, .. }) => assert_eq!(max, 4),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(granted, 4);

    let held: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM seats WHERE event_id = $1 AND status = 'LOCKED' AND locked_by = 'guest:greedy'",
    )
    .bind(event_id)
    .fetch_one(&env.db.pool)
    .await
    .unwrap();
    assert_eq!(held, 4);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unlock_only_releases_own_live_holds() {
    let env = setup().await;
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 10, 5000).await;
    let seats = env.create_seats(event_id, category_id, 3).await;
    let owner = guest_locker("owner");
    let stranger = guest_locker("stranger");

    env.state.locks.lock(event_id, &seats[0..2], &owner, None).await.unwrap();

    let outcome = env.state.locks.unlock(event_id, &seats, &stranger).await.unwrap();
    assert_eq!(outcome.released_count, 0);
    assert_eq!(env.seat_status(seats[0]).await.0, "LOCKED");

    let outcome = env.state.locks.unlock(event_id, &seats, &owner).await.unwrap();
    assert_eq!(outcome.released_count, 2);
    assert_eq!(env.seat_status(seats[0]).await, ("AVAILABLE".to_string(), None));

    let outcome = env.state.locks.unlock(event_id, &seats, &owner).await.unwrap();
    assert_eq!(outcome.released_count, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn lapsed_lock_is_reclaimed_by_the_next_read() {
    let env = setup().await;
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 10, 5000).await;
    let seat = env.create_seats(event_id, category_id, 1).await[0];
    let first = guest_locker("first");

    env.state.locks.lock(event_id, &[seat], &first, Some(1)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    // Expired holds cannot be released any more
    assert_eq!(env.state.locks.unlock(event_id, &[seat], &first).await.unwrap().released_count, 0);

    let layout = env.state.seats.layout(event_id, None).await.unwrap();
    assert_eq!(layout.len(), 1);
    assert_eq!(layout[0].status, SeatStatus::Available);
    assert!(layout[0].lock_expires_at.is_none());
    assert_eq!(env.seat_status(seat).await, ("AVAILABLE".to_string(), None));

    let second = guest_locker("second");
    env.state.locks.lock(event_id, &[seat], &second, None).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn lapsed_lock_can_be_taken_over_without_a_read() {
    let env = setup().await;
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 10, 5000).await;
    let seat = env.create_seats(event_id, category_id, 1).await[0];

    env.state.locks.lock(event_id, &[seat], &guest_locker("slow"), Some(1)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let grant = env.state.locks.lock(event_id, &[seat], &guest_locker("fast"), None).await.unwrap();
    assert_eq!(grant.locker_id, "guest:fast");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn background_sweep_reclaims_locks_on_unread_events() {
    let env = setup().await;
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 10, 5000).await;
    let seats = env.create_seats(event_id, category_id, 2).await;

    env.state.locks.lock(event_id, &seats, &guest_locker("idle"), Some(1)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let reclaimed = env.state.expiry.sweep_lapsed_locks().await.unwrap();
    assert_eq!(reclaimed, 2);
    assert_eq!(env.seat_status(seats[1]).await, ("AVAILABLE".to_string(), None));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn zone_read_filters_and_unknown_event_is_not_found() {
    let env = setup_with(&[("MAX_SEATS_PER_LOCKER", "8")]).await;
    let event_id = env.create_event().await;
    let category_id = env.create_category(event_id, 10, 5000).await;
    env.create_seats(event_id, category_id, 3).await;

    let floor = env.state.seats.layout(event_id, Some("floor")).await.unwrap();
    assert_eq!(floor.len(), 3);
    let balcony = env.state.seats.layout(event_id, Some("balcony")).await.unwrap();
    assert!(balcony.is_empty());

    let err = env.state.seats.layout(event_id + 1000, None).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
