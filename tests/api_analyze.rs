use anyhow::Result;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use ppe_frame_server::api::{ApiConfig, ApiHandle, ApiServer};
use ppe_frame_server::detect::{RawDetection, StubBackend};
use ppe_frame_server::multipart::MultipartBuilder;
use ppe_frame_server::{CooldownGate, FrameHandler, HttpAlertDispatcher, PpeDetector};

/// Alert backend answering every request with `status` after an adjustable
/// delay. Each connection is served on its own thread.
struct FakeAlertBackend {
    base_url: String,
    hits: Arc<AtomicUsize>,
    delay_ms: Arc<AtomicU64>,
}

impl FakeAlertBackend {
    fn start(status: u16, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let delay_ms = Arc::new(AtomicU64::new(delay.as_millis() as u64));
        let counter = hits.clone();
        let delay_shared = delay_ms.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                let delay = Duration::from_millis(delay_shared.load(Ordering::SeqCst));
                std::thread::spawn(move || {
                    drain_request(&mut stream);
                    std::thread::sleep(delay);
                    let _ = write!(
                        stream,
                        "HTTP/1.1 {} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    );
                });
            }
        });
        Self {
            base_url,
            hits,
            delay_ms,
        }
    }

    fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn drain_request(stream: &mut TcpStream) {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    while let Ok(n) = stream.read(&mut buf) {
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..end]).to_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= end + 4 + len {
                break;
            }
        }
    }
}

struct Service {
    api: Option<ApiHandle>,
    work_dir: TempDir,
}

impl Service {
    fn start(backend: StubBackend, alert_base: &str, alert_timeout: Duration) -> Result<Self> {
        let work_dir = tempdir()?;
        let handler = FrameHandler::new(
            PpeDetector::new(backend, 0.4),
            CooldownGate::new(Duration::from_secs(30)),
            Arc::new(HttpAlertDispatcher::with_timeout(alert_base, "test-token", alert_timeout)),
            work_dir.path(),
        );
        let cfg = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        };
        let api = ApiServer::new(cfg, Arc::new(handler)).spawn()?;
        Ok(Self {
            api: Some(api),
            work_dir,
        })
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.api.as_ref().unwrap().addr
    }

    fn leftover_files(&self) -> usize {
        std::fs::read_dir(self.work_dir.path()).unwrap().count()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if let Some(api) = self.api.take() {
            let _ = api.stop();
        }
    }
}

fn hardhat_backend() -> StubBackend {
    StubBackend::with_detections(vec![
        RawDetection::new("no-hardhat", 0.75, [12.0, 8.0, 60.0, 70.0]),
        RawDetection::new("person", 0.9, [0.0, 0.0, 100.0, 100.0]),
    ])
}

fn jpeg_frame() -> Vec<u8> {
    let mut bytes = Vec::new();
    RgbImage::from_pixel(160, 120, Rgb([120, 130, 140]))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .unwrap();
    bytes
}

fn send(addr: std::net::SocketAddr, request: &[u8]) -> Result<(u16, Value)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.write_all(request)?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response headers");
    let head = String::from_utf8_lossy(&response[..end]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let body = serde_json::from_slice(&response[end + 4..])?;
    Ok((status, body))
}

fn analyze_request(form: MultipartBuilder) -> Vec<u8> {
    let (content_type, body) = form.finish();
    let mut request = format!(
        "POST /analyze/ HTTP/1.1\r\nHost: localhost\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        content_type,
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    request
}

fn analyze(addr: std::net::SocketAddr, camera_id: &str) -> Result<(u16, Value)> {
    let form = MultipartBuilder::new()
        .text("cameraId", camera_id)
        .file("file", "frame.jpg", "image/jpeg", &jpeg_frame());
    send(addr, &analyze_request(form))
}

fn unused_base_url() -> String {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    format!("http://127.0.0.1:{}", port)
}

#[test]
fn frame_without_detections_returns_empty_result() -> Result<()> {
    let alerts = FakeAlertBackend::start(200, Duration::ZERO);
    let service = Service::start(StubBackend::new(), &alerts.base_url, Duration::from_secs(5))?;

    let (status, body) = analyze(service.addr(), "cam-1")?;

    assert_eq!(status, 200);
    assert_eq!(body["cameraId"], "cam-1");
    assert_eq!(body["detections"], Value::Array(vec![]));
    assert_eq!(body["alertSent"], false);
    assert_eq!(alerts.hits(), 0);
    assert_eq!(service.leftover_files(), 0);
    Ok(())
}

#[test]
fn first_alert_is_sent_and_repeat_is_suppressed() -> Result<()> {
    let alerts = FakeAlertBackend::start(200, Duration::ZERO);
    let service = Service::start(hardhat_backend(), &alerts.base_url, Duration::from_secs(5))?;

    let (status, body) = analyze(service.addr(), "cam-1")?;
    assert_eq!(status, 200);
    assert_eq!(body["alertSent"], true);
    let detections = body["detections"].as_array().unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0]["missingPpe"], "hardhat");
    assert_eq!(detections[0]["confidence"], 0.75);
    assert_eq!(detections[0]["bbox"]["x"], 12);
    assert_eq!(detections[0]["bbox"]["y"], 8);
    assert_eq!(detections[0]["bbox"]["width"], 48);
    assert_eq!(detections[0]["bbox"]["height"], 62);
    assert_eq!(alerts.hits(), 1);

    let (status, body) = analyze(service.addr(), "cam-1")?;
    assert_eq!(status, 200);
    assert_eq!(body["alertSent"], false);
    assert_eq!(body["detections"].as_array().unwrap().len(), 1);
    assert_eq!(alerts.hits(), 1);

    let (_, body) = analyze(service.addr(), "cam-2")?;
    assert_eq!(body["alertSent"], true);
    assert_eq!(alerts.hits(), 2);

    assert_eq!(service.leftover_files(), 0);
    Ok(())
}

#[test]
fn alert_timeout_still_returns_detections() -> Result<()> {
    let alerts = FakeAlertBackend::start(200, Duration::from_secs(2));
    let service = Service::start(hardhat_backend(), &alerts.base_url, Duration::from_millis(300))?;

    let (status, body) = analyze(service.addr(), "cam-1")?;

    assert_eq!(status, 200);
    assert_eq!(body["alertSent"], false);
    assert_eq!(body["detections"].as_array().unwrap().len(), 1);
    assert_eq!(alerts.hits(), 1);

    // the timed-out attempt left the cooldown untouched
    alerts.set_delay(Duration::ZERO);
    let (status, body) = analyze(service.addr(), "cam-1")?;
    assert_eq!(status, 200);
    assert_eq!(body["alertSent"], true);
    assert_eq!(alerts.hits(), 2);
    assert_eq!(service.leftover_files(), 0);
    Ok(())
}

#[test]
fn unreachable_alert_backend_does_not_consume_cooldown() -> Result<()> {
    let service = Service::start(hardhat_backend(), &unused_base_url(), Duration::from_secs(2))?;

    let (status, body) = analyze(service.addr(), "cam-1")?;
    assert_eq!(status, 200);
    assert_eq!(body["alertSent"], false);

    // the next frame is admitted again and fails the same way
    let (_, body) = analyze(service.addr(), "cam-1")?;
    assert_eq!(body["alertSent"], false);
    assert_eq!(service.leftover_files(), 0);
    Ok(())
}

#[test]
fn missing_fields_are_rejected() -> Result<()> {
    let service = Service::start(hardhat_backend(), &unused_base_url(), Duration::from_secs(1))?;

    let no_camera = MultipartBuilder::new().file("file", "frame.jpg", "image/jpeg", &jpeg_frame());
    let (status, body) = send(service.addr(), &analyze_request(no_camera))?;
    assert_eq!(status, 422);
    assert!(body["detail"].as_str().unwrap().contains("cameraId"));

    let no_file = MultipartBuilder::new().text("cameraId", "cam-1");
    let (status, body) = send(service.addr(), &analyze_request(no_file))?;
    assert_eq!(status, 422);
    assert!(body["detail"].as_str().unwrap().contains("file"));
    Ok(())
}

#[test]
fn undecodable_frame_is_a_server_error() -> Result<()> {
    let service = Service::start(hardhat_backend(), &unused_base_url(), Duration::from_secs(1))?;

    let form = MultipartBuilder::new()
        .text("cameraId", "cam-1")
        .file("file", "frame.jpg", "image/jpeg", b"not really a jpeg");
    let (status, body) = send(service.addr(), &analyze_request(form))?;

    assert_eq!(status, 500);
    assert_eq!(body["detail"], "frame analysis failed");
    assert_eq!(service.leftover_files(), 0);
    Ok(())
}

#[test]
fn health_and_routing() -> Result<()> {
    let service = Service::start(StubBackend::new(), &unused_base_url(), Duration::from_secs(1))?;

    let (status, body) = send(service.addr(), b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (status, _) = send(service.addr(), b"GET /analyze/ HTTP/1.1\r\nHost: x\r\n\r\n")?;
    assert_eq!(status, 405);

    let (status, _) = send(service.addr(), b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")?;
    assert_eq!(status, 404);

    let (status, _) = send(
        service.addr(),
        b"POST /analyze/ HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi",
    )?;
    assert_eq!(status, 400);
    Ok(())
}

#[test]
fn content_length_is_required_and_validated() -> Result<()> {
    let service = Service::start(hardhat_backend(), &unused_base_url(), Duration::from_secs(1))?;

    let (status, body) = send(
        service.addr(),
        b"POST /analyze/ HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=abc\r\n\r\n",
    )?;
    assert_eq!(status, 411);
    assert_eq!(body["detail"], "length_required");

    let (status, body) = send(
        service.addr(),
        b"POST /analyze/ HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=abc\r\nContent-Length: lots\r\n\r\n",
    )?;
    assert_eq!(status, 400);
    assert_eq!(body["detail"], "invalid_content_length");
    assert_eq!(service.leftover_files(), 0);
    Ok(())
}

#[test]
fn camera_id_is_used_as_sent() -> Result<()> {
    let alerts = FakeAlertBackend::start(200, Duration::ZERO);
    let service = Service::start(hardhat_backend(), &alerts.base_url, Duration::from_secs(5))?;

    let (_, body) = analyze(service.addr(), "cam-1")?;
    assert_eq!(body["cameraId"], "cam-1");
    assert_eq!(body["alertSent"], true);

    // a padded id is a different camera with its own cooldown
    let (status, body) = analyze(service.addr(), " cam-1 ")?;
    assert_eq!(status, 200);
    assert_eq!(body["cameraId"], " cam-1 ");
    assert_eq!(body["alertSent"], true);
    assert_eq!(alerts.hits(), 2);

    let no_camera = MultipartBuilder::new()
        .text("cameraId", "")
        .file("file", "frame.jpg", "image/jpeg", &jpeg_frame());
    let (status, _) = send(service.addr(), &analyze_request(no_camera))?;
    assert_eq!(status, 422);
    Ok(())
}

#[test]
fn oversized_upload_is_rejected() -> Result<()> {
    let work_dir = tempdir()?;
    let handler = FrameHandler::new(
        PpeDetector::new(StubBackend::new(), 0.4),
        CooldownGate::default(),
        Arc::new(HttpAlertDispatcher::new(&unused_base_url(), "t")),
        work_dir.path(),
    );
    let cfg = ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        max_upload_bytes: 16,
        ..ApiConfig::default()
    };
    let api = ApiServer::new(cfg, Arc::new(handler)).spawn()?;

    let form = MultipartBuilder::new()
        .text("cameraId", "cam-1")
        .file("file", "frame.jpg", "image/jpeg", &jpeg_frame());
    let (content_type, body) = form.finish();
    let request = format!(
        "POST /analyze/ HTTP/1.1\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        content_type,
        body.len()
    );
    let (status, _) = send(api.addr, request.as_bytes())?;
    assert_eq!(status, 413);

    api.stop()?;
    assert_eq!(std::fs::read_dir(work_dir.path())?.count(), 0);
    Ok(())
}
