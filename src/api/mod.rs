use crate::multipart::FormData;
use crate::pipeline::FrameHandler;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
    pub read_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            read_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    handler: Arc<FrameHandler>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, handler: Arc<FrameHandler>) -> Self {
        Self { cfg, handler }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let handler = self.handler.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, handler, shutdown_thread) {
                log::error!("analyze api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    handler: Arc<FrameHandler>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let cfg = Arc::new(cfg);
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let cfg = cfg.clone();
                let handler = handler.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &handler, &cfg) {
                        log::warn!("analyze api request rejected: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, handler: &FrameHandler, cfg: &ApiConfig) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(cfg.read_timeout))?;

    let head = read_head(&mut stream)?;
    match (head.method.as_str(), head.path.as_str()) {
        ("GET", "/health") => {
            write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
            return Ok(());
        }
        ("POST", "/analyze/" | "/analyze") => {}
        (_, "/health" | "/analyze/" | "/analyze") => {
            write_json_response(&mut stream, 405, r#"{"detail":"method_not_allowed"}"#)?;
            return Ok(());
        }
        _ => {
            write_json_response(&mut stream, 404, r#"{"detail":"not_found"}"#)?;
            return Ok(());
        }
    }

    let content_length = match head.content_length() {
        Ok(Some(len)) => len,
        Ok(None) => {
            write_json_response(&mut stream, 411, r#"{"detail":"length_required"}"#)?;
            return Ok(());
        }
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"detail":"invalid_content_length"}"#)?;
            return Err(err);
        }
    };
    if content_length > cfg.max_upload_bytes {
        write_json_response(&mut stream, 413, r#"{"detail":"payload_too_large"}"#)?;
        return Ok(());
    }
    let body = read_body(&mut stream, head.body_prefix, content_length)?;

    let content_type = head.headers.get("content-type").cloned().unwrap_or_default();
    let form = match FormData::parse(&content_type, &body) {
        Ok(form) => form,
        Err(err) => {
            write_detail(&mut stream, 400, &format!("invalid multipart body: {}", err))?;
            return Err(err);
        }
    };

    let camera_id = match form.text("cameraId") {
        Ok(Some(id)) if !id.is_empty() => id,
        Ok(_) => {
            write_detail(&mut stream, 422, "field 'cameraId' is required")?;
            return Ok(());
        }
        Err(err) => {
            write_detail(&mut stream, 422, "field 'cameraId' must be text")?;
            return Err(err);
        }
    };
    let frame = match form.field("file") {
        Some(part) if !part.data.is_empty() => &part.data,
        _ => {
            write_detail(&mut stream, 422, "field 'file' is required")?;
            return Ok(());
        }
    };

    match handler.analyze(&camera_id, frame) {
        Ok(response) => {
            let payload = serde_json::to_vec(&response)?;
            write_response(&mut stream, 200, "application/json", &payload)?;
        }
        Err(err) => {
            log::error!("frame analysis failed for camera {}: {:#}", camera_id, err);
            write_json_response(&mut stream, 500, r#"{"detail":"frame analysis failed"}"#)?;
        }
    }
    Ok(())
}

#[derive(Debug)]
struct RequestHead {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    /// Body bytes that arrived together with the header block.
    body_prefix: Vec<u8>,
}

impl RequestHead {
    fn content_length(&self) -> Result<Option<usize>> {
        match self.headers.get("content-length") {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("invalid content-length '{}'", value)),
            None => Ok(None),
        }
    }
}

fn read_head(stream: &mut TcpStream) -> Result<RequestHead> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };
    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(RequestHead {
        method: method.to_string(),
        path,
        headers,
        body_prefix: data[header_end + 4..].to_vec(),
    })
}

fn read_body(stream: &mut TcpStream, prefix: Vec<u8>, content_length: usize) -> Result<Vec<u8>> {
    let mut body = prefix;
    if body.len() > content_length {
        body.truncate(content_length);
        return Ok(body);
    }
    let remaining = content_length - body.len();
    body.reserve(remaining);
    stream
        .take(remaining as u64)
        .read_to_end(&mut body)?;
    if body.len() != content_length {
        return Err(anyhow!(
            "request body truncated: expected {} bytes, got {}",
            content_length,
            body.len()
        ));
    }
    Ok(body)
}

fn write_detail(stream: &mut TcpStream, status: u16, detail: &str) -> Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "detail": detail }))?;
    write_response(stream, status, "application/json", &body)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        411 => "HTTP/1.1 411 Length Required",
        413 => "HTTP/1.1 413 Payload Too Large",
        422 => "HTTP/1.1 422 Unprocessable Entity",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
