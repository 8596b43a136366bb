pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod controllers;
pub mod middleware;
pub mod services;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use services::{
    bookings::BookingOrchestrator,
    expiry::ExpiryReconciler,
    locks::LockManager,
    seats::SeatRegistry,
    tickets::TicketQueue,
};

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub db: database::Database,
    pub config: config::Config,
    pub seats: SeatRegistry,
    pub locks: LockManager,
    pub bookings: BookingOrchestrator,
    pub tickets: TicketQueue,
    pub expiry: ExpiryReconciler,
}

impl AppState {
    pub fn new(config: config::Config, db: database::Database) -> Arc<Self> {
        Arc::new(Self {
            seats: SeatRegistry::new(db.clone()),
            locks: LockManager::new(db.clone(), config.locks.clone()),
            bookings: BookingOrchestrator::new(
                db.clone(),
                config.reservations.clone(),
                config.tickets.clone(),
            ),
            tickets: TicketQueue::new(db.clone(), config.tickets.clone()),
            expiry: ExpiryReconciler::new(db.clone(), config.reservations.clone()),
            db,
            config,
        })
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Ticket inventory API v1.0" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", controllers::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
