//! Tributary Server - Main entry point
//!
//! Builds every configured event source, starts them, and runs until
//! Ctrl-C or SIGTERM.

use std::sync::Arc;

use tributary_core::{
    config::Config,
    sources::{build_source, LoggingSubscriber, SourceRegistry},
    telemetry::init_telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let loaded = match std::env::var("TRIBUTARY_CONFIG") {
        Ok(path) => Config::from_file(&path),
        Err(_) => Config::load(),
    };
    let config = loaded.unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    let telemetry = init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        sources = config.sources.len(),
        "Starting Tributary Server"
    );

    let registry = SourceRegistry::new();
    let logger = Arc::new(LoggingSubscriber);

    for source_config in config.enabled_sources() {
        match build_source(source_config).await {
            Ok(source) => {
                source.on_event(logger.clone());
                registry.register(source);
            }
            Err(e) => {
                e.log();
                tracing::error!(
                    source_id = %source_config.id,
                    kind = source_config.kind(),
                    error = %e,
                    "Skipping source that could not be built"
                );
            }
        }
    }

    let started = registry.start_all().await;
    for (source_id, message) in &started.failed {
        tracing::error!(source_id = %source_id, error = %message, "Source failed to start");
    }

    let stats = registry.stats();
    tracing::info!(
        stats = %serde_json::to_string(&stats).unwrap_or_default(),
        "Event sources started"
    );

    shutdown_signal().await;

    let stopped = registry.stop_all().await;
    for (source_id, message) in &stopped.failed {
        tracing::error!(source_id = %source_id, error = %message, "Source failed to stop");
    }

    telemetry.shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
}
