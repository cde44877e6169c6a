//! ppe_server - missing-PPE detection service
//!
//! This daemon:
//! 1. Loads the detector model
//! 2. Serves `POST /analyze/` for camera frames
//! 3. Forwards cooldown-gated alerts to the configured backend

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use ppe_frame_server::api::{ApiConfig, ApiServer};
use ppe_frame_server::config::{ModelSettings, ServerConfig};
use ppe_frame_server::detect::StubBackend;
use ppe_frame_server::{CooldownGate, FrameHandler, HttpAlertDispatcher, PpeDetector};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect missing PPE in camera frames and raise alerts")]
struct Args {
    /// JSON config file. Environment variables override its values.
    #[arg(long, env = "PPE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file and PPE_API_ADDR.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = ServerConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let detector = build_detector(&config.model)?;
    if config.alerts.base_url.is_empty() {
        log::warn!("OJITOO_BASE_URL is not set; alerts will fail to deliver");
    }
    let dispatcher = HttpAlertDispatcher::new(&config.alerts.base_url, &config.alerts.token);
    log::info!(
        "alerts go to {} (cooldown {:?})",
        dispatcher.endpoint(),
        config.alerts.cooldown
    );

    let handler = FrameHandler::new(
        detector,
        CooldownGate::new(config.alerts.cooldown),
        Arc::new(dispatcher),
        config.work_dir.clone(),
    );
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        max_upload_bytes: config.max_upload_bytes,
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, Arc::new(handler)).spawn()?;
    log::info!("analyze api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("ppe_server waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}

fn build_detector(settings: &ModelSettings) -> Result<PpeDetector> {
    let detector = match settings.backend.as_str() {
        "stub" => {
            log::warn!("using stub detector backend; no frame will report missing PPE");
            PpeDetector::new(StubBackend::new(), settings.confidence_threshold)
        }
        "tract" => tract_detector(settings)?,
        other => return Err(anyhow!("unknown detector backend '{}'", other)),
    };
    detector.warm_up()?;
    log::info!(
        "{} detector ready (confidence threshold {})",
        detector.backend_name()?,
        detector.confidence_threshold()
    );
    Ok(detector)
}

#[cfg(feature = "backend-tract")]
fn tract_detector(settings: &ModelSettings) -> Result<PpeDetector> {
    use ppe_frame_server::detect::{load_labels, TractBackend, DEFAULT_CLASS_LABELS};

    let labels = match &settings.labels_path {
        Some(path) => load_labels(path)?,
        None => DEFAULT_CLASS_LABELS
            .iter()
            .map(|label| label.to_string())
            .collect(),
    };
    log::info!("loading detector model from {}", settings.path.display());
    let backend = TractBackend::new(&settings.path, settings.input_size, labels)?;
    Ok(PpeDetector::new(backend, settings.confidence_threshold))
}

#[cfg(not(feature = "backend-tract"))]
fn tract_detector(_settings: &ModelSettings) -> Result<PpeDetector> {
    Err(anyhow!(
        "tract backend not compiled in; rebuild with --features backend-tract or use PPE_DETECTOR_BACKEND=stub"
    ))
}
