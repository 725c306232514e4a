//! Inference gateway binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use inference_gateway::dispatch::{PriorityQueue, WorkerRouter};
use inference_gateway::limit::MemoryRateLimiter;
use inference_gateway::{app, metrics, AppState, Blocklist, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting inference gateway");

    metrics::register_metrics()?;

    // Blocklist for the forward-proxy path
    let blocklist = match Blocklist::load_from_file(&config.blocklist.path) {
        Ok(blocklist) => {
            tracing::info!(
                "Loaded blocklist with {} rules from {}",
                blocklist.len(),
                config.blocklist.path
            );
            blocklist
        }
        Err(e) => {
            tracing::warn!("Could not load blocklist: {}", e);
            Blocklist::default()
        }
    };

    // Rate limiter
    let limiter = Arc::new(MemoryRateLimiter::new(
        config.limit.requests_per_minute,
        config.limit.burst,
    ));
    let _cleanup_task = Arc::clone(&limiter).spawn_cleanup(Duration::from_secs(300));
    tracing::info!(
        "Rate limiter initialized ({} rpm, burst {})",
        config.limit.requests_per_minute,
        config.limit.burst
    );

    // Forward-proxy HTTP client
    let http_client = reqwest::Client::builder()
        .connect_timeout(config.proxy.dial_timeout())
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    // Inference dispatch core, when workers are configured
    let addresses = config.workers.parsed_addresses();
    let (queue, worker_router) = if addresses.is_empty() {
        tracing::warn!("No worker addresses configured; inference endpoint disabled");
        (None, None)
    } else {
        let queue = Arc::new(PriorityQueue::new());
        let router = Arc::new(WorkerRouter::new(
            &addresses,
            Arc::clone(&queue),
            config.workers.inference_timeout(),
        )?);
        router.start().await;
        tracing::info!("Inference gateway initialized with {} workers", router.worker_count());
        (Some(queue), Some(router))
    };

    let state = Arc::new(AppState {
        config: config.clone(),
        queue,
        limiter,
        blocklist: Arc::new(blocklist),
        http_client,
    });

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain the dispatch core: reject new submissions, let queued and
    // in-flight requests finish, bounded by the shutdown timeout.
    if let Some(router) = worker_router {
        tracing::info!("Draining inference queue");
        if tokio::time::timeout(config.shutdown_timeout(), router.close())
            .await
            .is_err()
        {
            tracing::warn!(
                "Shutdown timeout of {:?} elapsed before the queue drained",
                config.shutdown_timeout()
            );
        }
    }

    tracing::info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
