use anyhow::{Context, Result};
use noel_core::{Clock, StateAggregator, SystemClock};
use noel_store::SqliteStore;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod api;
mod broadcast;
mod config;
mod gallery;
mod pipeline;
mod transport;

use broadcast::BroadcastHub;
use config::Config;
use gallery::GalleryMatcher;
use pipeline::{Counters, Pipeline};
use transport::TransportHandle;

/// Decoded events waiting for the pipeline. The transport waits when full.
const EVENT_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "noeld starting");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "refusing to start");
            return Err(e).context("loading configuration");
        }
    };

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening store at {}", config.db_path.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let matcher = Arc::new(GalleryMatcher::new(store.clone(), config.similarity_threshold));
    match matcher.refresh().await {
        Ok(count) => tracing::info!(identities = count, "gallery loaded"),
        Err(e) => tracing::warn!(error = %e, "gallery not loaded; matching unavailable until next refresh"),
    }
    let refresh_task = Arc::clone(&matcher).spawn_refresh(config.gallery_refresh);

    let aggregator = StateAggregator::new(clock.clone());
    let reader = aggregator.reader();
    let hub = Arc::new(BroadcastHub::new(reader.clone(), config.observer_buffer));
    let counters = Arc::new(Counters::default());

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (transport, transport_task) =
        TransportHandle::connect(&config.mqtt, events_tx, counters.clone());

    let mut pipeline = Pipeline::new(
        matcher,
        store.clone(),
        hub.clone(),
        aggregator,
        clock.clone(),
        counters.clone(),
        config.dedup_window_ms,
    );
    if config.mqtt.publish_checkins {
        let topic = format!("{}/checkin", config.mqtt.namespace);
        pipeline = pipeline.with_checkin_acks(Arc::new(transport.clone()), topic);
    }
    if config.dedup_restore {
        if let Err(e) = pipeline.restore_dedup().await {
            tracing::warn!(error = %e, "dedup restore failed; starting with an empty window");
        }
    }
    let pipeline_task = tokio::spawn(pipeline.run(events_rx));

    let state = api::ApiState {
        reader,
        hub: hub.clone(),
        checkins: store.clone(),
        registry: store,
        transport: Arc::new(transport.clone()),
        counters,
        clock,
        started: Instant::now(),
    };
    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;
    tracing::info!(addr = %config.http_addr, "noeld ready");

    let shutdown_hub = hub.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("noeld shutting down");
            shutdown_hub.close_all();
        })
        .await
        .context("serving queries")?;

    // Stop ingesting, then let the pipeline finish what is already queued.
    transport.disconnect();
    if let Err(e) = transport_task.await {
        tracing::warn!(error = %e, "transport task ended abnormally");
    }
    if let Err(e) = pipeline_task.await {
        tracing::warn!(error = %e, "pipeline task ended abnormally");
    }
    refresh_task.abort();

    tracing::info!("noeld stopped");
    Ok(())
}
