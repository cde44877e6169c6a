//! Alert delivery to the review backend.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::detect::Detection;
use crate::multipart::MultipartBuilder;

pub const ALERT_TIMEOUT: Duration = Duration::from_secs(15);
const ALERT_STATUS_NEW: &str = "new";
const ALERT_IMAGE_STEM: &str = "frame";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub camera_id: String,
    pub status: &'static str,
    #[serde(rename = "ppeDetections")]
    pub detections: Vec<Detection>,
}

impl AlertPayload {
    pub fn new(camera_id: &str, detections: &[Detection]) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            status: ALERT_STATUS_NEW,
            detections: detections.to_vec(),
        }
    }
}

/// Destination for admitted alerts.
///
/// Implementations report delivery as a plain boolean: errors are logged at the
/// sink and never propagated to the request.
pub trait AlertSink: Send + Sync {
    fn dispatch(&self, payload: &AlertPayload, image: &Path) -> bool;
}

/// Posts alerts as multipart to `{base_url}/alerts/` under a bearer token.
pub struct HttpAlertDispatcher {
    endpoint: String,
    token: String,
    agent: ureq::Agent,
}

impl HttpAlertDispatcher {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self::with_timeout(base_url, token, ALERT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, token: &str, timeout: Duration) -> Self {
        Self {
            endpoint: format!("{}/alerts/", base_url.trim_end_matches('/')),
            token: token.to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send(&self, payload: &AlertPayload, image: &Path) -> Result<u16> {
        let image_bytes = std::fs::read(image)
            .with_context(|| format!("failed to read alert image {}", image.display()))?;
        let payload_json = serde_json::to_string(payload)?;
        let (filename, mime) = image_part(&image_bytes);
        let (content_type, body) = MultipartBuilder::new()
            .text("payload", &payload_json)
            .file("file", &filename, mime, &image_bytes)
            .finish();

        let response = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Content-Type", &content_type)
            .send_bytes(&body)
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => anyhow!("alert backend returned status {}", code),
                ureq::Error::Transport(transport) => anyhow!("alert transport error: {}", transport),
            })?;
        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(anyhow!("alert backend returned status {}", status));
        }
        Ok(status)
    }
}

/// File name and content type for the image part, from the file's content.
/// Annotated frames are JPEG; the raw upload may be anything `image` reads.
fn image_part(bytes: &[u8]) -> (String, &'static str) {
    match image::guess_format(bytes) {
        Ok(format) => {
            let ext = format.extensions_str().first().copied().unwrap_or("bin");
            (format!("{}.{}", ALERT_IMAGE_STEM, ext), format.to_mime_type())
        }
        Err(_) => (
            format!("{}.bin", ALERT_IMAGE_STEM),
            "application/octet-stream",
        ),
    }
}

impl AlertSink for HttpAlertDispatcher {
    fn dispatch(&self, payload: &AlertPayload, image: &Path) -> bool {
        match self.send(payload, image) {
            Ok(status) => {
                log::info!(
                    "alert sent for camera {} [{}]",
                    payload.camera_id,
                    status
                );
                true
            }
            Err(err) => {
                log::error!(
                    "failed to send alert for camera {}: {:#}",
                    payload.camera_id,
                    err
                );
                false
            }
        }
    }
}
