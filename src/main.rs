//! Entry point: read configuration, build the Worker pool, start it, then
//! serve HTTP until a shutdown signal arrives.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use ocr_pool_service::config::Config;
use ocr_pool_service::http::{build_router, AppState};
use ocr_pool_service::pool::Pool;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ocr_pool_service=info,tower_http=info"
                    .parse()
                    .expect("default EnvFilter directive is valid")
            }),
        )
        .with_target(true)
        .init();

    let config = Config::from_env();
    info!(
        worker_count = config.worker_count,
        queue_max_size = config.queue_max_size,
        port = config.port,
        "ocr-pool-service starting"
    );

    let spawn_spec = config.worker_spawn_spec();
    let (pool, events_rx) = Pool::new(&config, spawn_spec);

    tokio::spawn(Arc::clone(&pool).run_event_loop(events_rx));

    if let Err(e) = pool.init().await {
        error!(error = %e, "no OCR worker ever became ready, refusing to serve");
        std::process::exit(1);
    }

    let state = AppState {
        pool: Arc::clone(&pool),
        config: Arc::new(config.clone()),
    };
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, port = config.port, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };
    info!(port = config.port, "listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "HTTP server error");
    }

    info!("shutting down, terminating OCR workers");
    pool.shutdown().await;
}

/// Resolves on SIGINT (Ctrl-C) or, on Unix, SIGTERM — whichever arrives
/// first — so the pool gets a chance to kill its child processes instead of
/// leaving them orphaned.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
