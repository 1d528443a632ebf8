//! Motion imagery ingest service.
//!
//! Listens for an MPEG transport stream on a UDP socket, catalogs it as
//! segment records under one parent record, and reconciles the parent when
//! the stream goes idle or the service stops.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with INGEST_)
//!
//! See `config.rs` for detailed configuration options.

use kestrel_ingest::catalog::InMemoryCatalog;
use kestrel_ingest::config::{IngestConfig, LoggingConfig};
use kestrel_ingest::ingest::CatalogSegmentIngester;
use kestrel_ingest::security::AddressSubjectProvider;
use kestrel_ingest::{StreamListener, StreamProcessor, StreamSettings};

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "kestrel-ingest",
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.stream.bind_address,
        title = %config.stream.title,
        "Starting motion imagery ingest service"
    );

    // Validate configuration
    config.validate()?;

    match run_stream(config).await {
        Ok(()) => {
            info!("Ingest service completed successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Ingest service failed");
            Err(e)
        }
    }
}

/// Load configuration from files, falling back to the environment.
fn load_config() -> anyhow::Result<IngestConfig> {
    let config = IngestConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        IngestConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter =
        EnvFilter::from_default_env().add_directive(format!("kestrel_ingest={}", level).parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer()
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.format == "json" {
        subscriber.with(layer.json()).init();
    } else {
        subscriber.with(layer.pretty()).init();
    }

    Ok(())
}

/// Run one stream until Ctrl+C, then drain it.
async fn run_stream(config: IngestConfig) -> anyhow::Result<()> {
    let catalog = Arc::new(InMemoryCatalog::new());

    let processor = StreamProcessor::standard(
        StreamSettings::from(&config),
        catalog.clone(),
        Arc::new(CatalogSegmentIngester::new(catalog.clone())),
        Arc::new(AddressSubjectProvider::default()),
    );
    processor.start().await?;

    let listener = Arc::new(StreamListener::new(config.stream.clone(), processor.clone()));
    let mut listener_handle = tokio::spawn({
        let listener = listener.clone();
        async move { listener.run().await }
    });

    let shutdown_signal = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    };

    tokio::select! {
        _ = shutdown_signal => {
            info!("Initiating graceful shutdown...");
        }
        result = &mut listener_handle => {
            match result {
                Ok(Ok(())) => warn!("Listener exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "Listener failed"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
    }

    listener.stop();

    // A second Ctrl+C abandons catalog updates still waiting to retry.
    let force_handle = tokio::spawn({
        let abort = processor.abort_token();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Second interrupt, abandoning pending catalog updates");
                abort.cancel();
            }
        }
    });

    let shutdown = processor.shutdown().await;
    force_handle.abort();

    log_final_stats(&processor, &listener, &catalog);

    shutdown?;
    info!("Shutdown complete");
    Ok(())
}

/// Log final statistics on shutdown.
fn log_final_stats(processor: &StreamProcessor, listener: &StreamListener, catalog: &InMemoryCatalog) {
    info!("=== Final Statistics ===");

    let listener_stats = listener.stats();
    info!(
        datagrams_received = listener_stats.datagrams_received,
        bytes_received = listener_stats.bytes_received,
        receive_errors = listener_stats.receive_errors,
        bind_attempts = listener_stats.bind_attempts,
        "Listener final stats"
    );

    let stats = processor.stats();
    info!(
        packets = stats.packets,
        bytes_discarded = stats.bytes_discarded,
        metadata_sets = stats.metadata_sets,
        metadata_errors = stats.metadata_errors,
        rollovers = stats.rollovers,
        children_created = stats.children_created,
        rollover_failures = stats.rollover_failures,
        reconciliations = stats.reconciliations,
        "Stream final stats"
    );

    info!(records = catalog.len(), "Catalog final stats");

    if let Some(parent) = processor.context().parent() {
        match serde_json::to_string(&parent) {
            Ok(json) => info!(parent = %json, "Final parent record"),
            Err(e) => warn!(error = %e, "Unable to serialize parent record"),
        }
    }
}
