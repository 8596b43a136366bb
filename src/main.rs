use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ticket_inventory::{
    app,
    config::{Config, LogFormat},
    database::Database,
    services::tickets::{QrTicketIssuer, TicketWorker},
    AppState,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;

    let filter = tracing_subscriber::EnvFilter::new(&config.app.rust_log);
    match config.app.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting ticket inventory engine");

    // Connect to the database
    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    info!("Database connected");

    db.run_migrations().await.context("Failed to run migrations")?;

    let state = AppState::new(config.clone(), db.clone());

    // --- Start background tasks ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = tokio::spawn(state.expiry.clone().run(shutdown_rx.clone()));

    let issuer = Arc::new(QrTicketIssuer::new(config.tickets.signing_secret.clone()));
    let worker = TicketWorker::new(db.clone(), state.tickets.clone(), issuer);
    let ticket_worker = tokio::spawn(worker.run(shutdown_rx));

    // --- Start the web server ---
    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .context("Invalid HOST/PORT")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down background workers");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(reconciler, ticket_worker);

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
