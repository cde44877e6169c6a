//! Per-request orchestration.
//!
//! `Received → Detected → (NoDetections | Annotated → Gated → (Suppressed |
//! Dispatching → (Sent | Failed))) → CleanedUp → Responded`
//!
//! Temporary files are held by [`TransientArtifact`] guards owned by
//! [`FrameHandler::analyze`], so cleanup runs on every exit path including
//! detector errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::alert::{AlertPayload, AlertSink};
use crate::annotate::Annotator;
use crate::artifact::TransientArtifact;
use crate::cooldown::{Clock, CooldownGate, SystemClock};
use crate::detect::{Detection, PpeDetector};

/// Terminal state of one analyzed frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    NoDetections,
    Suppressed,
    Sent,
    Failed,
}

impl FrameOutcome {
    pub fn alert_sent(self) -> bool {
        matches!(self, FrameOutcome::Sent)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub camera_id: String,
    pub detections: Vec<Detection>,
    pub alert_sent: bool,
}

pub struct FrameHandler {
    detector: PpeDetector,
    annotator: Annotator,
    gate: CooldownGate,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    work_dir: PathBuf,
}

impl FrameHandler {
    pub fn new(
        detector: PpeDetector,
        gate: CooldownGate,
        alerts: Arc<dyn AlertSink>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let work_dir = work_dir.into();
        Self {
            detector,
            annotator: Annotator::new(work_dir.clone()),
            gate,
            alerts,
            clock: Arc::new(SystemClock),
            work_dir,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Analyze one uploaded frame for `camera_id`.
    ///
    /// Errors only when the frame cannot be stored, decoded or run through the
    /// detector. Alert delivery problems surface as `alert_sent: false`.
    pub fn analyze(&self, camera_id: &str, frame: &[u8]) -> Result<AnalyzeResponse> {
        let upload = TransientArtifact::write(&self.work_dir, "temp_", ".jpg", frame)
            .context("failed to store uploaded frame")?;

        let detections = self
            .detector
            .detect_path(upload.path())
            .context("missing-PPE detection failed")?;

        let outcome = if detections.is_empty() {
            FrameOutcome::NoDetections
        } else {
            let annotated = self.annotator.annotate(upload.path(), &detections);
            let image = annotated
                .as_ref()
                .map(TransientArtifact::path)
                .unwrap_or_else(|| upload.path());
            self.gated_dispatch(camera_id, &detections, image)
        };

        match outcome {
            FrameOutcome::NoDetections => {
                log::debug!("camera {}: no missing PPE", camera_id)
            }
            FrameOutcome::Suppressed => {
                log::info!("skipping alert for camera {} (cooldown active)", camera_id)
            }
            FrameOutcome::Sent => log::info!(
                "camera {}: {} missing-PPE detection(s), alert sent",
                camera_id,
                detections.len()
            ),
            FrameOutcome::Failed => log::warn!(
                "camera {}: {} missing-PPE detection(s), alert not delivered",
                camera_id,
                detections.len()
            ),
        }

        Ok(AnalyzeResponse {
            camera_id: camera_id.to_string(),
            detections,
            alert_sent: outcome.alert_sent(),
        })
    }

    fn gated_dispatch(&self, camera_id: &str, detections: &[Detection], image: &Path) -> FrameOutcome {
        let now = self.clock.now();
        let Some(permit) = self.gate.try_acquire(camera_id, now) else {
            return FrameOutcome::Suppressed;
        };
        let payload = AlertPayload::new(camera_id, detections);
        if self.alerts.dispatch(&payload, image) {
            permit.commit(now);
            FrameOutcome::Sent
        } else {
            FrameOutcome::Failed
        }
    }
}
