use axum::http::{Method, header};
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whiteboard_sync::RoomRegistry;
use whiteboard_sync_server::{AppState, blob_store::build_blob_store, config::Config, router};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "whiteboard_sync=debug,whiteboard_sync_server=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Whiteboard Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("CORS origins: {:?}", config.cors_origins);
    info!(
        persist_interval_ms = config.persist_interval.as_millis() as u64,
        access_token = config.access_token.is_some(),
        "Room settings"
    );

    let blob_store = match build_blob_store(config.as_ref()).await {
        Ok(store) => store,
        Err(err) => {
            error!("Failed to initialize blob store: {}", err);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(RoomRegistry::new(blob_store, config.room_settings()));
    let state = AppState::new(registry.clone(), config.as_ref());

    // Build CORS layer
    let origins: Vec<_> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
        .allow_origin(AllowOrigin::list(origins));

    let app = router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Start daily backup sweep
    {
        let registry = registry.clone();
        let period = config.backup_sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let created = registry.backup_all().await;
                if created > 0 {
                    info!("Backup sweep created {} backups", created);
                }
            }
        });
    }

    // Start idle room eviction
    {
        let registry = registry.clone();
        let period = config.room_idle_sweep;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = registry.sweep_idle().await;
                debug!("Idle sweep removed {} rooms", removed);
            }
        });
    }

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    info!("Flushing live rooms");
    registry.flush_all().await;
    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
