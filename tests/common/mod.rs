//! Shared fixtures for the PostgreSQL-backed integration tests.
//!
//! Docker must be running: every test starts its own PostgreSQL 16 container
//! through testcontainers, so tests never share state.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

use ticket_inventory::config::Config;
use ticket_inventory::database::Database;
use ticket_inventory::middleware::LockerId;
use ticket_inventory::services::bookings::{GuestContact, Purchaser};
use ticket_inventory::AppState;

pub struct TestEnv {
    // Keeps the container alive for the duration of the test
    _container: ContainerAsync<Postgres>,
    pub db: Database,
    pub state: Arc<AppState>,
}

pub async fn setup() -> TestEnv {
    setup_with(&[]).await
}

/// Starts PostgreSQL, runs migrations, and builds the application state with
/// `overrides` applied on top of the default configuration.
pub async fn setup_with(overrides: &[(&str, &str)]) -> TestEnv {
    let container = Postgres::default()
        .with_tag("16-alpine")
        .start()
        .await
        .expect("Failed to start Postgres container");

    let host = container.get_host().await.expect("Failed to get container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get container port");
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

    let mut env: HashMap<String, String> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    env.insert("DATABASE_URL".to_string(), url);
    env.entry("GUEST_PASSWORD_HASH_COST".to_string())
        .or_insert_with(|| "4".to_string());

    let config = Config::from_lookup(|key| env.get(key).cloned()).expect("Invalid test config");

    let db = Database::connect(&config.database)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");

    let state = AppState::new(config, db.clone());

    TestEnv { _container: container, db, state }
}

impl TestEnv {
    pub async fn create_event(&self) -> i64 {
        sqlx::query_scalar("INSERT INTO events (title, starts_at) VALUES ('Concert', NOW() + INTERVAL '30 days') RETURNING id")
            .fetch_one(&self.db.pool)
            .await
            .expect("Failed to insert event")
    }

    pub async fn create_category(&self, event_id: i64, total_seats: i32, price_cents: i64) -> i64 {
        sqlx::query_scalar(
            "INSERT INTO ticket_categories (event_id, name, default_price_cents, total_seats) VALUES ($1, 'Standard', $2, $3) RETURNING id",
        )
        .bind(event_id)
        .bind(price_cents)
        .bind(total_seats)
        .fetch_one(&self.db.pool)
        .await
        .expect("Failed to insert category")
    }

    /// Seats `A-1..A-n` in zone "floor", all belonging to `category_id`.
    pub async fn create_seats(&self, event_id: i64, category_id: i64, count: i32) -> Vec<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO seats (event_id, category_id, seat_ref, zone, row_label, seat_number, price_cents)
            SELECT $1, $2, 'A-' || n, 'floor', 'A', n, NULL::BIGINT
            FROM generate_series(1, $3) AS n
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(category_id)
        .bind(count)
        .fetch_all(&self.db.pool)
        .await
        .expect("Failed to insert seats")
    }

    pub async fn seat_status(&self, seat_id: i64) -> (String, Option<String>) {
        sqlx::query_as("SELECT status, locked_by FROM seats WHERE id = $1")
            .bind(seat_id)
            .fetch_one(&self.db.pool)
            .await
            .expect("Failed to read seat")
    }

    pub async fn booked_seats(&self, category_id: i64) -> i32 {
        sqlx::query_scalar("SELECT booked_seats FROM ticket_categories WHERE id = $1")
            .bind(category_id)
            .fetch_one(&self.db.pool)
            .await
            .expect("Failed to read category")
    }

    pub async fn booking_status(&self, booking_id: i64) -> String {
        sqlx::query_scalar("SELECT status FROM bookings WHERE id = $1")
            .bind(booking_id)
            .fetch_one(&self.db.pool)
            .await
            .expect("Failed to read booking")
    }

    /// Makes every pending ticket queue entry due right now.
    pub async fn make_ticket_entries_due(&self) {
        sqlx::query("UPDATE ticket_generation_queue SET next_attempt_at = NOW() WHERE status = 'pending'")
            .execute(&self.db.pool)
            .await
            .expect("Failed to reschedule ticket entries");
    }

    /// Ages every in-flight ticket claim past any claim timeout, as if its
    /// worker died mid-attempt.
    pub async fn expire_ticket_claims(&self) {
        sqlx::query(
            "UPDATE ticket_generation_queue SET claimed_at = NOW() - INTERVAL '1 day' WHERE status = 'processing'",
        )
        .execute(&self.db.pool)
        .await
        .expect("Failed to age ticket claims");
    }
}

pub fn guest_locker(token: &str) -> LockerId {
    LockerId::resolve(None, Some(token)).expect("valid guest token")
}

pub fn guest(email: &str) -> Purchaser {
    Purchaser::Guest(GuestContact {
        email: email.to_string(),
        first_name: "Test".to_string(),
        last_name: "Buyer".to_string(),
    })
}
