// src/main.rs

mod alarm_pusher;
mod analysis;
mod api_server;
mod config;
mod param_store;
mod pipeline;
mod snapshot;
mod types;

use alarm_pusher::{AlarmPusher, DispatchSettings, HttpTransport};
use analysis::{RoiEngine, TrackerConfig};
use anyhow::{Context, Result};
use api_server::ApiState;
use param_store::{FileParamStore, ParamStore};
use pipeline::{AlarmHistory, JsonlReplaySource, PipelineMetrics, PipelineRunner};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use types::{AlarmInfo, Config};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load_or_default(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("📷 IPC ROI alarm service starting");
    info!("✓ Configuration loaded from {}", config_path);

    let store: Arc<dyn ParamStore> = Arc::new(FileParamStore::open(&config.params.path)?);
    let metrics = PipelineMetrics::new();
    let history = Arc::new(AlarmHistory::with_capacity(config.alarm.history_capacity));

    // ── ROI engine ─────────────────────────────────────────────────────
    let tracker_config = if config.pipeline.fast_tracker {
        TrackerConfig::fast()
    } else {
        TrackerConfig::default()
    };
    let engine = Arc::new(RoiEngine::with_tracker_config(store.clone(), tracker_config));
    match engine.load_config() {
        Ok(()) => {
            let areas = engine.roi_areas();
            info!(
                "✓ ROI engine ready: {} areas, classes {:?}",
                areas.len(),
                engine.detection_classes()
            );
            for area in &areas {
                debug!(
                    "  ROI {} ({}) group {:?}, stay {}s, cooldown {}s",
                    area.id,
                    area.name,
                    engine.group_of_roi(area.id),
                    area.stay_time,
                    area.cooldown_time
                );
            }
        }
        Err(e) => warn!("ROI engine inactive: {}", e),
    }

    // ── Alarm dispatch ─────────────────────────────────────────────────
    // The blocking HTTP client is built before any async runtime exists.
    let pusher = Arc::new(
        AlarmPusher::new(DispatchSettings::from(&config.alarm)).with_metrics(metrics.clone()),
    );
    pusher.set_local_observer(Box::new(|alarm: &AlarmInfo| {
        debug!(
            "Alarm {} queued for ROI {} track {}",
            alarm.alarm_id, alarm.roi_id, alarm.track_id
        );
    }));
    let transport = HttpTransport::from_params(store.as_ref(), &config.alarm)?;
    info!("📡 Alarm endpoint: {}", transport.url());
    pusher.start(Box::new(transport))?;

    {
        let pusher = pusher.clone();
        engine.register_alarm_callback(Box::new(move |alarm: &AlarmInfo| pusher.on_alarm(alarm)));
    }
    {
        let history = history.clone();
        let metrics = metrics.clone();
        engine.register_alarm_callback(Box::new(move |alarm: &AlarmInfo| {
            metrics.inc(&metrics.alarms_fired);
            history.record(alarm);
        }));
    }

    // ── Pipeline thread ────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let pipeline_handle = match &config.pipeline.replay_path {
        Some(path) => {
            let source = JsonlReplaySource::open(
                Path::new(path),
                config.pipeline.frame_width as usize,
                config.pipeline.frame_height as usize,
                config.pipeline.frame_interval_ms,
            )?;
            let runner = PipelineRunner::new(
                engine.clone(),
                metrics.clone(),
                Duration::from_millis(config.pipeline.frame_interval_ms),
                shutdown.clone(),
            );
            Some(runner.spawn(Box::new(source))?)
        }
        None => {
            info!("No detection source configured, pipeline idle");
            None
        }
    };

    // ── API server / wait for Ctrl-C ───────────────────────────────────
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let api_key = config
        .api
        .api_key
        .clone()
        .or_else(|| Some(store.get_string("api:key", "")))
        .filter(|k| !k.is_empty());

    runtime.block_on(async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        };

        if config.api.enabled {
            let state = ApiState {
                engine: engine.clone(),
                history: history.clone(),
                metrics: metrics.clone(),
                api_key,
                started_at: Instant::now(),
            };
            api_server::serve(&config.api.bind, state, ctrl_c).await
        } else {
            ctrl_c.await;
            Ok(())
        }
    })?;

    // ── Shutdown: stop feeding frames, then stop dispatch ──────────────
    shutdown.store(true, Ordering::SeqCst);
    if let Some(handle) = pipeline_handle {
        match handle.join() {
            Ok(frames) => info!("Pipeline stopped after {} frames", frames),
            Err(_) => error!("Pipeline thread panicked"),
        }
    }
    pusher.stop();

    let summary = metrics.summary();
    info!("\n========================================");
    info!("  Frames processed: {}", summary.total_frames);
    info!("  Detections received: {}", summary.detections_received);
    info!("  🚨 Alarms fired: {}", summary.alarms_fired);
    info!("  📤 Pushed: {} ok, {} failed", summary.push_successes, summary.push_failures);
    info!("========================================");

    Ok(())
}
