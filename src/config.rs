use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::api::DEFAULT_MAX_UPLOAD_BYTES;

const DEFAULT_API_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_DETECTOR_BACKEND: &str = "tract";
const DEFAULT_MODEL_PATH: &str = "model/best.onnx";
const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.4;
const DEFAULT_COOLDOWN_SECS: f64 = 30.0;

pub const DETECTOR_BACKENDS: &[&str] = &["tract", "stub"];

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    api: Option<ApiConfigFile>,
    model: Option<ModelConfigFile>,
    alerts: Option<AlertConfigFile>,
    work_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_upload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    backend: Option<String>,
    path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    base_url: Option<String>,
    token: Option<String>,
    cooldown_seconds: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub api_addr: String,
    pub max_upload_bytes: usize,
    pub model: ModelSettings,
    pub alerts: AlertSettings,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub backend: String,
    pub path: PathBuf,
    pub labels_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub base_url: String,
    pub token: String,
    pub cooldown: Duration,
}

impl ServerConfig {
    /// Load from `PPE_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PPE_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit config file (if any) and the environment.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServerConfigFile) -> Result<Self> {
        let api = file.api.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let alerts = file.alerts.unwrap_or_default();
        Ok(Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_upload_bytes: api.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            model: ModelSettings {
                backend: model
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
                path: model
                    .path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                labels_path: model.labels_path,
                input_size: model.input_size.unwrap_or(DEFAULT_MODEL_INPUT_SIZE),
                confidence_threshold: model
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            },
            alerts: AlertSettings {
                base_url: alerts.base_url.unwrap_or_default(),
                token: alerts.token.unwrap_or_default(),
                cooldown: cooldown_from_secs(alerts.cooldown_seconds.unwrap_or(DEFAULT_COOLDOWN_SECS))?,
            },
            work_dir: file.work_dir.unwrap_or_else(std::env::temp_dir),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("PPE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(limit) = non_empty_env("PPE_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = limit
                .parse()
                .map_err(|_| anyhow!("PPE_MAX_UPLOAD_BYTES must be an integer number of bytes"))?;
        }
        if let Some(backend) = non_empty_env("PPE_DETECTOR_BACKEND") {
            self.model.backend = backend;
        }
        if let Some(path) = non_empty_env("MODEL_PATH") {
            self.model.path = PathBuf::from(path);
        }
        if let Some(path) = non_empty_env("MODEL_LABELS_PATH") {
            self.model.labels_path = Some(PathBuf::from(path));
        }
        if let Some(size) = non_empty_env("MODEL_INPUT_SIZE") {
            self.model.input_size = size
                .parse()
                .map_err(|_| anyhow!("MODEL_INPUT_SIZE must be a positive integer"))?;
        }
        if let Some(threshold) = non_empty_env("YOLO_CONFIDENCE_THRESHOLD") {
            self.model.confidence_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("YOLO_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        if let Ok(url) = std::env::var("OJITOO_BASE_URL") {
            self.alerts.base_url = url.trim().to_string();
        }
        if let Ok(token) = std::env::var("AUTHORIZATION_TOKEN") {
            self.alerts.token = token;
        }
        if let Some(cooldown) = non_empty_env("ALERT_COOLDOWN_SECONDS") {
            let seconds: f64 = cooldown
                .parse()
                .map_err(|_| anyhow!("ALERT_COOLDOWN_SECONDS must be a number of seconds"))?;
            self.alerts.cooldown = cooldown_from_secs(seconds)?;
        }
        if let Some(dir) = non_empty_env("PPE_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.model.backend = self.model.backend.trim().to_lowercase();
        if !DETECTOR_BACKENDS.contains(&self.model.backend.as_str()) {
            return Err(anyhow!(
                "unknown detector backend '{}'; expected one of {:?}",
                self.model.backend,
                DETECTOR_BACKENDS
            ));
        }
        let threshold = self.model.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if self.model.input_size == 0 {
            return Err(anyhow!("model input size must be greater than zero"));
        }
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("max upload size must be greater than zero"));
        }
        self.alerts.base_url = self.alerts.base_url.trim_end_matches('/').to_string();
        if !self.alerts.base_url.is_empty() {
            let url = Url::parse(&self.alerts.base_url)
                .map_err(|e| anyhow!("invalid alert base url '{}': {}", self.alerts.base_url, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!(
                    "alert base url must use http or https, got '{}'",
                    url.scheme()
                ));
            }
        }
        Ok(())
    }
}

fn cooldown_from_secs(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| anyhow!("cooldown must be a finite, non-negative number of seconds"))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<ServerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
