mod api;
mod config;
mod error;
mod models;
mod services;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use dotenv::dotenv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{AppConfig, LedgerMode};
use models::AuthState;
use services::clock::{Clock, SystemClock};
use services::local_ledger::LocalLedger;
use services::remote::{HttpAccountDeriver, HttpLedgerConnector};
use services::session::LedgerConnector;
use services::{ControllerDeps, LedgerController};

#[tokio::main]
async fn main() {
    // load env vars
    dotenv().ok();

    let config = AppConfig::from_env().expect("Invalid configuration");

    // initialize logging
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    std::fs::create_dir_all(&config.data_dir).expect("Failed to create data directory");

    // initialize db
    let db_path = config.data_dir.join("ledger.db");
    let db_manager = Arc::new(storage::DbManager::new(&db_path).expect("Failed to open database"));
    let preferences = Arc::new(storage::Preferences::new(db_manager));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let call_timeout = config.controller.call_timeout;

    let connector: Arc<dyn LedgerConnector> = match config.ledger_mode {
        LedgerMode::Local => {
            tracing::info!(
                "Using in-process ledger with a {}s security delay",
                config.local_withdraw_delay.as_secs()
            );
            Arc::new(LocalLedger::new(config.local_withdraw_delay, clock.clone()))
        }
        LedgerMode::Remote => {
            tracing::info!("Using ledger service at {}", config.ledger_service_url);
            Arc::new(
                HttpLedgerConnector::new(config.ledger_service_url.clone(), call_timeout)
                    .expect("Failed to build ledger client"),
            )
        }
    };
    let deriver = HttpAccountDeriver::new(config.derivation_service_url.clone(), call_timeout)
        .expect("Failed to build derivation client");

    let controller = LedgerController::new(
        config.controller.clone(),
        ControllerDeps {
            connector: Some(connector),
            deriver: Some(Arc::new(deriver)),
            clock,
            preferences: Some(preferences),
        },
    )
    .expect("Failed to initialize ledger controller");

    let (auth_tx, auth_rx) = watch::channel(AuthState::default());
    controller.watch_auth(auth_rx);
    controller.restore_preferences().await;

    let api_state = api::ApiState {
        controller: controller.clone(),
        auth_tx: Arc::new(auth_tx),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = api::router(api_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await.unwrap();

    tracing::info!(
        "Ledger server for {} listening on {}",
        config.controller.network,
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    controller.shutdown();
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    tracing::info!("Shutting down gracefully...");
}
