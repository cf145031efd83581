// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP transport seam.
//!
//! The replicator speaks to its peer through [`HttpTransport`], one request
//! in and one fully-buffered response out. Production code uses
//! [`ReqwestTransport`]; tests plug in an in-memory peer.
//!
//! Status codes are not interpreted here. A transport error means no HTTP
//! response was obtained at all (DNS, connect, reset, timeout).

use crate::error::{ReplicationError, Result};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

/// HTTP methods used by the replication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        })
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Overrides the transport's default timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Attach a JSON body and content type.
    pub fn with_json(mut self, body: &Value) -> Self {
        self.set_header("Content-Type", "application/json");
        self.body = Some(body.to_string().into_bytes());
        self
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.set_header("Content-Type", content_type);
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set a header, replacing any existing value (case-insensitive).
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Body parsed as JSON, if it is JSON.
    pub fn json_body(&self) -> Option<Value> {
        self.body.as_deref().and_then(|b| serde_json::from_slice(b).ok())
    }
}

/// A buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// A JSON response.
    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string().into_bytes())
            .with_header("Content-Type", "application/json")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Every value of a repeated header (e.g. `Set-Cookie`).
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    pub fn json_body(&self, operation: &str) -> Result<Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ReplicationError::protocol(operation, e.to_string()))
    }
}

/// No HTTP response was obtained.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Type alias for the boxed response future.
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<HttpResponse, TransportError>> + Send + 'a>>;

/// Sends one request and buffers the whole response.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(&self, request: HttpRequest) -> TransportFuture<'_>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// reqwest
// ═══════════════════════════════════════════════════════════════════════════════

/// Production transport over `reqwest`.
///
/// Cookies are managed by the peer client, not by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplicationError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (e.g., with custom TLS roots).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
        Box::pin(async move {
            let method = match request.method {
                Method::Get => reqwest::Method::GET,
                Method::Put => reqwest::Method::PUT,
                Method::Post => reqwest::Method::POST,
                Method::Delete => reqwest::Method::DELETE,
            };
            let mut builder = self.client.request(method, request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let response = builder.send().await.map_err(|e| TransportError(e.to_string()))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError(e.to_string()))?
                .to_vec();
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// multipart/related
// ═══════════════════════════════════════════════════════════════════════════════

/// A non-JSON part of a multipart document upload.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartPart {
    pub filename: Option<String>,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Encode a document and its attachment parts as `multipart/related`.
///
/// Returns the `Content-Type` header value and the body.
pub fn encode_multipart_related(boundary: &str, document: &Value, parts: &[MultipartPart]) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\nContent-Type: application/json\r\n\r\n").as_bytes());
    body.extend_from_slice(document.to_string().as_bytes());
    for part in parts {
        body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
        if let Some(name) = &part.filename {
            body.extend_from_slice(
                format!("Content-Disposition: attachment; filename=\"{name}\"\r\n").as_bytes(),
            );
        }
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", part.content_type).as_bytes());
        body.extend_from_slice(&part.data);
    }
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/related; boundary=\"{boundary}\""), body)
}

/// Decode a `multipart/related` body produced by [`encode_multipart_related`]
/// (or any conforming sender): the JSON document and the remaining parts.
pub fn decode_multipart_related(content_type: &str, body: &[u8]) -> Option<(Value, Vec<MultipartPart>)> {
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))?
        .trim_matches('"');
    let delimiter = format!("--{boundary}");

    let mut sections = Vec::new();
    let mut rest = body;
    while let Some(pos) = find(rest, delimiter.as_bytes()) {
        sections.push(&rest[..pos]);
        rest = &rest[pos + delimiter.len()..];
        if rest.starts_with(b"--") {
            break;
        }
    }
    // sections[0] is the preamble.
    let mut parts = sections.into_iter().skip(1).filter_map(|section| {
        let section = section.strip_prefix(b"\r\n").unwrap_or(section);
        let section = section.strip_suffix(b"\r\n").unwrap_or(section);
        let split = find(section, b"\r\n\r\n")?;
        let head = std::str::from_utf8(&section[..split]).ok()?;
        let data = section[split + 4..].to_vec();
        let mut content_type = String::from("application/octet-stream");
        let mut filename = None;
        for line in head.split("\r\n") {
            let (name, value) = line.split_once(':')?;
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-type") {
                content_type = value.to_string();
            } else if name.eq_ignore_ascii_case("content-disposition") {
                filename = value
                    .split(';')
                    .map(str::trim)
                    .find_map(|p| p.strip_prefix("filename="))
                    .map(|f| f.trim_matches('"').to_string());
            }
        }
        Some(MultipartPart {
            filename,
            content_type,
            data,
        })
    });

    let document = parts.next()?;
    let document: Value = serde_json::from_slice(&document.data).ok()?;
    Some((document, parts.collect()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
