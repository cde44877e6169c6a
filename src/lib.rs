//! PPE frame server
//!
//! Accepts camera frames over HTTP, detects missing personal protective
//! equipment and forwards throttled alerts to a review backend.
//!
//! # Request flow
//!
//! 1. The upload is stored as a request-scoped temporary file.
//! 2. A [`detect::DetectorBackend`] runs on the decoded frame; only negative PPE
//!    classes (`no-hardhat`, `no-vest`, ...) above the confidence threshold are
//!    kept.
//! 3. With at least one detection the frame is annotated, the per-camera
//!    [`cooldown::CooldownGate`] is consulted and, if admitted, the alert is
//!    dispatched.
//! 4. Temporary files are removed and `{ cameraId, detections, alertSent }` is
//!    returned.
//!
//! # Module Structure
//!
//! - `ppe`: fixed vocabulary and palette
//! - `detect`: detector backends and the missing-PPE adapter
//! - `annotate`: review image rendering
//! - `cooldown`: per-camera alert throttling
//! - `alert`: payload and HTTP delivery
//! - `pipeline`: per-request orchestration
//! - `api`: HTTP listener

pub mod alert;
pub mod annotate;
pub mod api;
pub mod artifact;
pub mod config;
pub mod cooldown;
pub mod detect;
pub mod multipart;
pub mod pipeline;
pub mod ppe;

pub use alert::{AlertPayload, AlertSink, HttpAlertDispatcher};
pub use cooldown::{AlertPermit, Clock, CooldownGate, SystemClock};
pub use detect::{BoundingBox, Detection, DetectorBackend, PpeDetector, RawDetection};
pub use pipeline::{AnalyzeResponse, FrameHandler, FrameOutcome};
pub use ppe::PpeKind;
