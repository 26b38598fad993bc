//! Quotabot API Server
//!
//! Serves quota checks and consumption for the chat bot, plus Stripe
//! checkout, cancellation and webhook endpoints.

use std::net::SocketAddr;

use quotabot_api::{create_router, AppState};
use quotabot_billing::{InvariantChecker, ViolationSeverity};
use quotabot_shared::{create_pool, run_migrations, Config};
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,quotabot_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Quotabot API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Opening database...");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database ready");

    check_invariants(&pool).await;

    // Create application state
    let state = AppState::new(pool, config.clone());

    let app = create_router(state).layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address().parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Report account inconsistencies at startup; never blocks serving
async fn check_invariants(pool: &SqlitePool) {
    match InvariantChecker::new(pool.clone()).run_all_checks().await {
        Ok(summary) => {
            for violation in &summary.violations {
                match violation.severity {
                    ViolationSeverity::High | ViolationSeverity::Medium => tracing::warn!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        users = violation.user_ids.len(),
                        "{}",
                        violation.description
                    ),
                    ViolationSeverity::Low => tracing::info!(
                        invariant = %violation.invariant,
                        users = violation.user_ids.len(),
                        "{}",
                        violation.description
                    ),
                }
            }
            tracing::info!(
                checks_run = summary.checks_run,
                checks_failed = summary.checks_failed,
                healthy = summary.healthy,
                "Account invariant checks complete"
            );
        }
        Err(e) => tracing::error!(error = %e, "Account invariant checks failed"),
    }
}
