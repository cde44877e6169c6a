//! Minimal `multipart/form-data` codec.
//!
//! Decoding covers what browsers, curl and HTTP client libraries send for
//! simple forms: CRLF line endings, one `Content-Disposition` per part, no
//! nested multipart. Encoding produces the two-part alert upload.

use anyhow::{anyhow, Context, Result};
use rand::RngCore;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_PART_HEADER_BYTES: usize = 8192;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Decoded form body.
#[derive(Clone, Debug, Default)]
pub struct FormData {
    parts: Vec<FormPart>,
}

impl FormData {
    /// Decode `body` using the boundary from a `Content-Type` header value.
    pub fn parse(content_type: &str, body: &[u8]) -> Result<Self> {
        let boundary = boundary_from_content_type(content_type)?;
        let delimiter = [b"--".as_slice(), boundary.as_bytes()].concat();
        let next_delimiter = [CRLF, delimiter.as_slice()].concat();

        let mut pos = find(body, &delimiter, 0)
            .ok_or_else(|| anyhow!("multipart body has no opening boundary"))?;
        let mut parts = Vec::new();
        loop {
            pos += delimiter.len();
            let rest = &body[pos..];
            if rest.starts_with(b"--") {
                break;
            }
            if !rest.starts_with(CRLF) {
                return Err(anyhow!("malformed multipart boundary line"));
            }
            pos += CRLF.len();

            let header_end = find(body, HEADER_END, pos)
                .filter(|end| end - pos <= MAX_PART_HEADER_BYTES)
                .ok_or_else(|| anyhow!("multipart part headers are unterminated"))?;
            let headers = std::str::from_utf8(&body[pos..header_end])
                .context("multipart part headers are not utf-8")?;
            let data_start = header_end + HEADER_END.len();
            let data_end = find(body, &next_delimiter, data_start)
                .ok_or_else(|| anyhow!("multipart body is unterminated"))?;

            parts.push(parse_part(headers, body[data_start..data_end].to_vec())?);
            pos = data_end + CRLF.len();
        }
        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    /// First part named `name`.
    pub fn field(&self, name: &str) -> Option<&FormPart> {
        self.parts.iter().find(|part| part.name == name)
    }

    /// First part named `name`, decoded as UTF-8 text.
    pub fn text(&self, name: &str) -> Result<Option<String>> {
        match self.field(name) {
            Some(part) => {
                let text = String::from_utf8(part.data.clone())
                    .with_context(|| format!("form field '{}' is not utf-8", name))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }
}

fn parse_part(headers: &str, data: Vec<u8>) -> Result<FormPart> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;
    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if key.trim().eq_ignore_ascii_case("content-disposition") {
            let mut params = value.split(';').map(str::trim);
            let disposition = params.next().unwrap_or_default();
            if !disposition.eq_ignore_ascii_case("form-data") {
                return Err(anyhow!("unsupported content disposition '{}'", disposition));
            }
            for param in params {
                if let Some((k, v)) = param.split_once('=') {
                    let v = unquote(v.trim()).to_string();
                    match k.trim().to_ascii_lowercase().as_str() {
                        "name" => name = Some(v),
                        "filename" => filename = Some(v),
                        _ => {}
                    }
                }
            }
        } else if key.trim().eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        }
    }
    let name = name.ok_or_else(|| anyhow!("multipart part has no field name"))?;
    Ok(FormPart {
        name,
        filename,
        content_type,
        data,
    })
}

/// Extract the boundary parameter of a `multipart/form-data` content type.
pub fn boundary_from_content_type(content_type: &str) -> Result<String> {
    let mut params = content_type.split(';').map(str::trim);
    let mime = params.next().unwrap_or_default();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return Err(anyhow!("expected multipart/form-data, got '{}'", mime));
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| unquote(v.trim()).to_string())
        .filter(|b| !b.is_empty() && b.len() <= 70)
        .ok_or_else(|| anyhow!("multipart content type has no valid boundary"))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|idx| idx + from)
}

/// Builder for an outbound `multipart/form-data` body.
#[derive(Debug)]
pub struct MultipartBuilder {
    boundary: String,
    body: Vec<u8>,
}

impl Default for MultipartBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartBuilder {
    pub fn new() -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            boundary: format!("ppe-frame-server-{}", hex::encode(nonce)),
            body: Vec::new(),
        }
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.open_part(&format!("form-data; name=\"{}\"", name), None);
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(CRLF);
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content_type: &str, data: &[u8]) -> Self {
        self.open_part(
            &format!("form-data; name=\"{}\"; filename=\"{}\"", name, filename),
            Some(content_type),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(CRLF);
        self
    }

    fn open_part(&mut self, disposition: &str, content_type: Option<&str>) {
        self.body
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body
            .extend_from_slice(format!("Content-Disposition: {}\r\n", disposition).as_bytes());
        if let Some(content_type) = content_type {
            self.body
                .extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        self.body.extend_from_slice(CRLF);
    }

    /// Close the body. Returns the `Content-Type` header value and the bytes.
    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body,
        )
    }
}
