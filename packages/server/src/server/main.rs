// Main entry point for the hardware value server

use anyhow::{Context, Result};
use server_core::domains::hardware::{
    register_listeners, Catalogue, CatalogueSource, RefreshValues, ValueStore,
};
use server_core::{server::build_app, server::AppState, Config};
use tickwork::{Dispatcher, PeriodicRoutine, Reactor, RetryAssistant, TimeIssuer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// The reactor is single-threaded, so everything runs on one thread; the
// HTTP server is a task on the same runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tickwork=debug,server_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting hardware value server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        scheduler = %config.scheduler,
        refresh_interval_secs = config.refresh_interval.as_secs(),
        actions_per_second = config.issuer.actions_per_second,
        "Configuration loaded"
    );

    let catalogue = match &config.catalogue_path {
        Some(path) => Catalogue::from_path(path)?,
        None => Catalogue::seed()?,
    };
    tracing::info!(listings = catalogue.listings.len(), "Catalogue loaded");

    // Wire the refresh pipeline onto the reactor
    let reactor = Reactor::new();
    let store = ValueStore::new();
    let source = CatalogueSource::new(&reactor, catalogue).with_latency(config.source_latency);
    let issuer = TimeIssuer::new(&reactor, config.issuer.clone());
    let dispatcher = Dispatcher::new(&reactor, config.scheduler);
    register_listeners(&dispatcher, &store);

    let work = RefreshValues::new(
        source,
        issuer.clone(),
        RetryAssistant::new(config.max_retries),
        dispatcher,
    );
    let routine = PeriodicRoutine::new(&reactor, work, config.refresh_interval);
    routine.start();

    // Start server
    let app = build_app(AppState::new(store, &config));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        _ = reactor.run() => {
            tracing::warn!("Reactor ran out of work");
        }
        result = server => {
            result.context("Server task failed")?.context("Server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    routine.stop();
    issuer.shutdown();

    Ok(())
}
