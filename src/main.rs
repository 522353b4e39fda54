//! Sentinel - zone-aware video surveillance core.
//!
//! Runs one camera session: opens the configured source, evaluates zones on
//! every frame, records evidence and broadcasts alerts until the source is
//! exhausted or Ctrl-C is pressed.
//!
//! # Configuration
//!
//! See [`sentinel::config`]. At minimum `SENTINEL_SOURCE` and
//! `SENTINEL_DETECTOR_URL` must be set.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sentinel::alerts::{Broadcaster, TelegramProtocol, WebhookProtocol};
use sentinel::config::SentinelConfig;
use sentinel::detector::RemoteDetector;
use sentinel::pipeline::Sentinel;
use sentinel::recorder::Recorder;
use sentinel::storage::{MemorySink, SqliteMemory};
use sentinel::stream::{StreamProcessor, source_from_path};
use sentinel::worker::BackgroundPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("sentinel=info".parse()?))
        .init();

    let config = SentinelConfig::load()?;
    if config.stream.source.is_empty() {
        anyhow::bail!("no capture source configured (set SENTINEL_SOURCE)");
    }

    info!(
        camera_id = %config.camera_id,
        source = %config.stream.source,
        fps = config.stream.fps,
        zones = config.zones.len(),
        device = %config.detector.device,
        "Starting Sentinel"
    );

    let zones = config.zone_engine()?;

    let detector = RemoteDetector::new(&config.detector)
        .context("set SENTINEL_DETECTOR_URL to the inference endpoint")?
        .with_camera_id(&config.camera_id);

    let recorder = Arc::new(Recorder::new(config.recorder.clone())?);

    let broadcaster = Arc::new(Broadcaster::new(config.alerts.timeout()));
    for url in &config.alerts.webhooks {
        broadcaster
            .register(Arc::new(
                WebhookProtocol::new(url).with_timeout(config.alerts.timeout()),
            ))
            .await;
    }
    if let Some(telegram) = &config.alerts.telegram {
        broadcaster
            .register(Arc::new(TelegramProtocol::new(&telegram.token, &telegram.chat_id)))
            .await;
    }
    if broadcaster.is_empty().await {
        warn!("No alert protocols configured, alerts will only be logged");
    }

    let memory = if config.memory.enabled {
        open_memory(&config).await
    } else {
        None
    };

    let mut sentinel = Sentinel::new(
        &config.camera_id,
        Arc::new(detector),
        zones,
        recorder,
        broadcaster,
    )
    .with_pool(BackgroundPool::new(config.memory.workers))
    .with_trigger_classes(config.trigger_classes.clone());
    if let Some(memory) = memory {
        sentinel = sentinel.with_memory(memory);
    }

    let source = source_from_path(&config.stream.source, config.stream.loop_source)?;
    let mut processor = StreamProcessor::new(source, config.stream.clone());
    processor.connect()?;

    let stop = processor.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            stop.stop();
        }
    });

    let summary = processor.run(&mut sentinel).await?;

    if let Some(segment) = sentinel.shutdown().await {
        info!(path = %segment.path.display(), frames = segment.frames, "Final segment saved");
    }

    info!(
        frames = summary.frames,
        read_failures = summary.read_failures,
        dropped_jobs = sentinel.pool().dropped_jobs(),
        "Sentinel stopped"
    );

    Ok(())
}

/// Open the memory database and apply retention. Failure disables memory
/// instead of aborting the session.
async fn open_memory(config: &SentinelConfig) -> Option<Arc<dyn MemorySink>> {
    let memory = match SqliteMemory::new(&config.memory.database_url).await {
        Ok(memory) => memory,
        Err(e) => {
            warn!(db_url = %config.memory.database_url, error = %e, "Memory unavailable, continuing without persistence");
            return None;
        }
    };

    if let Err(e) = memory
        .purge_older_than(config.memory.retention_days, Utc::now())
        .await
    {
        warn!(error = %e, "Retention purge failed");
    }

    info!(db_url = %config.memory.database_url, "Memory initialized");
    Some(Arc::new(memory))
}
