//! Pulp Manager - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulp_manager::services::credentials::CredentialsResolver;
use pulp_manager::services::scheduler::{spawn_scheduler, Scheduler};
use pulp_manager::services::worker::spawn_worker;
use pulp_manager::{api, config::Config, db, error::Result, fleet::FleetConfig};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Config and startup failures exit non-zero.
        eprintln!("pulp-manager failed to start: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulp_manager=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    tracing::info!("Starting Pulp Manager");

    let fleet_config = FleetConfig::load(&config.fleet_config_path)?;

    // Connect to database
    let db_pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("./migrations").run(&db_pool).await?;
    tracing::info!("Database migrations complete");

    // Apply the fleet config and register timers
    let scheduler = Scheduler::new(db_pool.clone());
    scheduler.reload(&fleet_config).await?;

    // Background loops: scheduler sweep and job worker
    spawn_scheduler(db_pool.clone());
    let resolver = CredentialsResolver::new(
        &config.app.vault,
        &config.app.remotes,
        config.vault_token.clone(),
    )?;
    spawn_worker(db_pool.clone(), config.clone(), resolver);

    // Reload the fleet config on SIGHUP; the catalog is swapped wholesale.
    spawn_reload_handler(scheduler, config.fleet_config_path.clone());

    // Create application state
    let state = Arc::new(api::AppState::new(config.clone(), db_pool));

    // Build router
    let app = Router::new()
        .merge(api::routes::create_router(state))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn spawn_reload_handler(scheduler: Scheduler, fleet_config_path: String) {
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            tracing::warn!("could not install SIGHUP handler; config reload disabled");
            return;
        };

        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading fleet config");
            match FleetConfig::load(&fleet_config_path) {
                Ok(fleet_config) => {
                    if let Err(e) = scheduler.reload(&fleet_config).await {
                        tracing::error!(error = %e, "fleet config reload failed");
                    }
                }
                Err(e) => {
                    // The previous catalog stays in effect.
                    tracing::error!(error = %e, "fleet config is invalid, keeping current");
                }
            }
        }
    });
}
