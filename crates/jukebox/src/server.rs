use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use jukebox_service::config::Config;
use jukebox_service::fetch::CommandFetcher;
use jukebox_service::metric;
use jukebox_service::search::CommandSearchProvider;
use jukebox_service::service::AudioService;

use crate::endpoints::{self, AppState, SearchState};

/// Starts the service and the HTTP server based on the loaded config.
///
/// Returns once the server received a shutdown signal and all pending work has completed.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let io_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("jukebox-io")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("jukebox-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let fetcher = Arc::new(CommandFetcher::from_config(&config.fetch));
    let service = AudioService::create(&config, fetcher, io_pool.handle().to_owned())
        .context("failed to create audio service")?;

    let search = config.search.enabled.then(|| SearchState {
        provider: Arc::new(CommandSearchProvider::from_config(&config.search)),
        base_url: config.public_base_url(),
        limit: config.search.limit,
    });
    let app = endpoints::create_app(AppState {
        audio: service.clone(),
        search,
    });

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address {}", config.bind))?;

    web_pool.block_on(async {
        let listener = tokio::net::TcpListener::bind(socket)
            .await
            .with_context(|| format!("failed to bind {socket}"))?;
        tracing::info!("Starting HTTP server on {}", socket);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Waiting for running fetches and pending removals");
        service.shutdown().await;
        anyhow::Ok(())
    })?;

    tracing::info!("System shutdown complete");
    Ok(())
}

/// Resolves on `SIGINT` or `SIGTERM`.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
