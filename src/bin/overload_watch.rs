//! overload_watch - overloaded-vehicle evidence daemon
//!
//! This daemon:
//! 1. Runs one stream worker (detect, track, match, dedup, persist evidence)
//! 2. Backfills analysis for stored records, one analyzer call at a time
//! 3. Optionally serves the read-only record API on loopback

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use overload_watch::analysis::summary_line;
use overload_watch::api::{ApiConfig, ApiServer};
use overload_watch::config::AppConfig;
use overload_watch::{ConfiguredFactory, Coordinator, Notification, StepOutcome};

const PUMP_INTERVAL: Duration = Duration::from_millis(10);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stream URL; overrides source.url from configuration.
    #[arg(long)]
    url: Option<String>,
    /// Label stored with each record; overrides source.label.
    #[arg(long)]
    label: Option<String>,
    /// Serve the record API on this loopback address.
    #[arg(long)]
    api_addr: Option<String>,
    /// Skip analysis even when an endpoint is configured.
    #[arg(long)]
    no_analysis: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = AppConfig::load()?;
    if let Some(url) = args.url {
        cfg.source.url = url;
    }
    if let Some(label) = args.label {
        cfg.source.label = label;
    }
    if let Some(addr) = args.api_addr {
        cfg.api.addr = addr;
        cfg.api.enabled = true;
    }
    if args.no_analysis {
        cfg.analysis.endpoint = None;
    }
    std::fs::create_dir_all(&cfg.evidence_dir)?;

    let api_handle = if cfg.api.enabled {
        let handle = ApiServer::new(ApiConfig {
            addr: cfg.api.addr.clone(),
            db_path: cfg.db_path.clone(),
        })
        .spawn()?;
        log::info!("record api listening on {}", handle.addr);
        Some(handle)
    } else {
        None
    };

    let factory = ConfiguredFactory::new(cfg.clone());
    let analyzer = factory.analyzer()?;
    let queue_settings = factory.queue_settings();
    let mut coordinator = Coordinator::new(Arc::new(factory), analyzer, queue_settings)?;
    if coordinator.has_analysis() {
        log::info!("analysis queue: {} records pending", coordinator.analysis_pending());
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    coordinator.start_stream(&cfg.source.url, &cfg.source.label)?;
    log::info!("overload_watch running. writing to {}", cfg.db_path);

    let mut last_health_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        match coordinator.pump() {
            Ok(Some(StepOutcome::Abandoned { track_id })) => {
                log::warn!("analysis for track {} abandoned until next start", track_id);
            }
            Ok(_) => {}
            Err(e) => log::warn!("analysis step failed: {:#}", e),
        }

        for event in coordinator.take_events() {
            match event {
                Notification::NewRecord {
                    track_id,
                    image_path,
                } => log::info!("new violation track={} evidence={}", track_id, image_path),
                Notification::AnalysisUpdated { image_path, .. } => {
                    match coordinator.store().analysis_for(&image_path) {
                        Ok(Some(text)) => log::info!("analysis {}: {}", image_path, summary_line(&text)),
                        Ok(None) => {}
                        Err(e) => log::warn!("analysis lookup failed: {:#}", e),
                    }
                }
                Notification::WorkerStopped { label } => {
                    log::info!("stream '{}' stopped", label);
                }
            }
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            if let Some(stats) = coordinator.worker_stats() {
                log::info!(
                    "frames={} flagged={} inserted={} analysis_pending={}",
                    stats.frames_read,
                    stats.flagged,
                    stats.inserted,
                    coordinator.analysis_pending()
                );
            }
            last_health_log = Instant::now();
        }
        std::thread::sleep(PUMP_INTERVAL);
    }

    log::info!("shutdown signal received, stopping stream...");
    coordinator.shutdown()?;
    if let Some(handle) = api_handle {
        handle.stop()?;
    }
    Ok(())
}
