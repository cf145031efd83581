// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client for the remote database.
//!
//! [`PeerClient`] wraps an [`HttpTransport`] with everything that is the
//! same for every request to one remote database:
//!
//! - URL building relative to the database URL
//! - custom headers from configuration, auth headers, and a cookie jar
//! - the shared request pool and optional rate limit
//! - `Server` header capture for capability detection
//! - status classification into [`ReplicationError`]
//!
//! # Request Lifecycle
//!
//! ```text
//! request() ──▶ decorate (headers, cookies) ──▶ pool permit ──▶ rate limit
//!                                                                  │
//!   Ok(response) ◀── 2xx ◀── classify ◀── capture Server/Set-Cookie ◀┘
//!   Err(TransientNetwork | TransientServer | PermanentRejection | Authentication)
//! ```
//!
//! Long-poll `_changes` requests skip the pool permit.
//!
//! Retrying is the caller's decision (see [`crate::resilience::retry_transient`]).

use crate::changes::{parse_changes, ChangesPage, ChangesQuery, FeedMode};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{Bulkhead, RateLimiter};
use crate::revision::RevisionId;
use crate::transport::{
    encode_multipart_related, HttpRequest, HttpResponse, HttpTransport, Method, MultipartPart,
};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use url::Url;

/// `Server` header prefix announced by Sync Gateway.
pub const SYNC_GATEWAY_SERVER_PREFIX: &str = "Couchbase Sync Gateway/";

/// Oldest Sync Gateway accepting `POST _changes`.
const POST_CHANGES_MIN_VERSION: &str = "0.93";

/// One row of a `_bulk_docs` response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BulkDocsResult {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl BulkDocsResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A revision requested through `_bulk_get`.
#[derive(Debug, Clone)]
pub struct BulkGetRequest {
    pub doc_id: String,
    pub rev: RevisionId,
    pub atts_since: Vec<RevisionId>,
}

/// One revision returned by `_bulk_get`.
#[derive(Debug, Clone)]
pub enum BulkGetItem {
    Found(Value),
    Failed {
        doc_id: String,
        rev: Option<String>,
        error: String,
        reason: String,
    },
}

/// Client bound to one remote database.
pub struct PeerClient {
    transport: Arc<dyn HttpTransport>,
    base_url: Url,
    headers: BTreeMap<String, String>,
    auth_headers: RwLock<Vec<(String, String)>>,
    cookies: RwLock<BTreeMap<String, String>>,
    server: RwLock<Option<String>>,
    bulk_get_rejected: AtomicBool,
    pool: Arc<Bulkhead>,
    limiter: Option<Arc<RateLimiter>>,
    request_timeout: Duration,
}

impl PeerClient {
    /// `base_url` is the database URL; a trailing slash is added if missing.
    pub fn new(transport: Arc<dyn HttpTransport>, mut base_url: Url, pool: Arc<Bulkhead>) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            transport,
            base_url,
            headers: BTreeMap::new(),
            auth_headers: RwLock::new(Vec::new()),
            cookies: RwLock::new(BTreeMap::new()),
            server: RwLock::new(None),
            bulk_get_rejected: AtomicBool::new(false),
            pool,
            limiter: None,
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Headers sent on every request.
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // URLs
    // ═══════════════════════════════════════════════════════════════════════════

    /// Resolve `path` (which may carry a query string) under the database
    /// URL. A leading slash is ignored: `/_session` and `_session` are the
    /// same.
    pub fn build_relative_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ReplicationError::Configuration(format!("bad path {path:?}: {e}")))
    }

    /// URL of a document. The id is percent-encoded as a single segment,
    /// except that `_design/` and `_local/` prefixes stay literal.
    pub fn document_url(&self, doc_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ReplicationError::Configuration("base URL cannot hold a path".into()))?;
            segments.pop_if_empty();
            match doc_id.split_once('/') {
                Some((prefix @ ("_design" | "_local"), rest)) => {
                    segments.push(prefix).push(rest);
                }
                _ => {
                    segments.push(doc_id);
                }
            }
        }
        Ok(url)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Headers and cookies
    // ═══════════════════════════════════════════════════════════════════════════

    /// Store a cookie sent on all later requests.
    pub fn set_cookie(&self, name: &str, value: &str) {
        self.cookies.write().insert(name.to_string(), value.to_string());
    }

    pub fn delete_cookie(&self, name: &str) {
        self.cookies.write().remove(name);
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.read().get(name).cloned()
    }

    /// Header added by the authenticator (e.g., `Authorization`).
    pub fn set_auth_header(&self, name: &str, value: &str) {
        let mut headers = self.auth_headers.write();
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        headers.push((name.to_string(), value.to_string()));
    }

    fn cookie_header(&self) -> Option<String> {
        let cookies = self.cookies.read();
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn absorb_set_cookies(&self, response: &HttpResponse) {
        for raw in response.header_all("Set-Cookie") {
            let Some((name, value)) = raw.split(';').next().and_then(|kv| kv.split_once('=')) else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            let expired = raw
                .split(';')
                .map(str::trim)
                .any(|attr| attr.eq_ignore_ascii_case("max-age=0"));
            if value.is_empty() || expired {
                self.delete_cookie(name);
            } else {
                trace!(cookie = name, "Stored cookie from peer");
                self.set_cookie(name, value);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Server capabilities
    // ═══════════════════════════════════════════════════════════════════════════

    /// Last `Server` header seen from the peer.
    pub fn server_header(&self) -> Option<String> {
        self.server.read().clone()
    }

    /// Record the server type (normally captured from responses).
    pub fn set_server_header(&self, server: &str) {
        *self.server.write() = Some(server.to_string());
    }

    /// True if the peer is Sync Gateway at `min_version` or newer.
    pub fn is_sync_gateway_version(&self, min_version: &str) -> bool {
        let server = self.server.read();
        let Some(version) = server
            .as_deref()
            .and_then(|s| s.strip_prefix(SYNC_GATEWAY_SERVER_PREFIX))
        else {
            return false;
        };
        compare_versions(version, min_version) != std::cmp::Ordering::Less
    }

    pub fn is_sync_gateway(&self) -> bool {
        self.server
            .read()
            .as_deref()
            .is_some_and(|s| s.starts_with(SYNC_GATEWAY_SERVER_PREFIX))
    }

    pub fn supports_post_changes(&self) -> bool {
        self.is_sync_gateway_version(POST_CHANGES_MIN_VERSION)
    }

    pub fn supports_bulk_get(&self) -> bool {
        self.is_sync_gateway() && !self.bulk_get_rejected.load(Ordering::Relaxed)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Requests
    // ═══════════════════════════════════════════════════════════════════════════

    /// Send a request, returning the response only for 2xx statuses.
    ///
    /// `operation` labels logs, metrics and errors. `doc_id` is attached to
    /// permanent rejections.
    pub async fn request(&self, operation: &str, request: HttpRequest, doc_id: Option<&str>) -> Result<HttpResponse> {
        self.send(operation, request, doc_id, true).await
    }

    /// `pooled: false` skips the request pool. Long polls park on the peer
    /// for up to a heartbeat and must not starve batch requests of permits.
    async fn send(
        &self,
        operation: &str,
        mut request: HttpRequest,
        doc_id: Option<&str>,
        pooled: bool,
    ) -> Result<HttpResponse> {
        for (name, value) in &self.headers {
            request.set_header(name, value.as_str());
        }
        for (name, value) in self.auth_headers.read().iter() {
            request.set_header(name, value.as_str());
        }
        if let Some(cookie) = self.cookie_header() {
            request.set_header("Cookie", cookie);
        }
        if request.header("Accept").is_none() {
            request.set_header("Accept", "application/json");
        }
        if request.timeout.is_none() {
            request.timeout = Some(self.request_timeout);
        }

        let _permit = if pooled {
            let permit = self.pool.acquire().await;
            Some(permit.map_err(|e| ReplicationError::Internal(e.to_string()))?)
        } else {
            None
        };
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let method = request.method;
        let url = request.url.clone();
        let start = Instant::now();
        let result = self.transport.send(request).await;
        let elapsed = start.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::record_request(operation, None, elapsed);
                debug!(operation, %method, url = %url, error = %e, "Request failed");
                return Err(ReplicationError::network(operation, e.0));
            }
        };
        metrics::record_request(operation, Some(response.status), elapsed);
        trace!(operation, %method, url = %url, status = response.status, "Response");

        if let Some(server) = response.header("Server") {
            self.set_server_header(server);
        }
        self.absorb_set_cookies(&response);

        if response.is_success() {
            Ok(response)
        } else {
            let mut err = ReplicationError::from_status(operation, response.status, doc_id);
            if let ReplicationError::PermanentRejection { reason, .. } = &mut err {
                if let Ok(body) = serde_json::from_slice::<Value>(&response.body) {
                    if let Some(r) = body.get("reason").and_then(Value::as_str) {
                        *reason = format!("HTTP {}: {r}", response.status);
                    }
                }
            }
            Err(err)
        }
    }

    /// GET a relative path and parse the JSON body.
    pub async fn get_json(&self, operation: &str, path: &str) -> Result<Value> {
        let url = self.build_relative_url(path)?;
        let response = self.request(operation, HttpRequest::new(Method::Get, url), None).await?;
        response.json_body(operation)
    }

    /// Send a JSON body to a relative path and parse the JSON response.
    pub async fn send_json(&self, operation: &str, method: Method, path: &str, body: &Value) -> Result<Value> {
        let url = self.build_relative_url(path)?;
        let request = HttpRequest::new(method, url).with_json(body);
        let response = self.request(operation, request, None).await?;
        response.json_body(operation)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Protocol endpoints
    // ═══════════════════════════════════════════════════════════════════════════

    /// `GET _local/<id>`. `None` when the document does not exist.
    pub async fn get_local(&self, local_id: &str) -> Result<Option<Value>> {
        match self.get_json("_local", &format!("_local/{local_id}")).await {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `PUT _local/<id>`. Returns the new revision tag.
    pub async fn put_local(&self, local_id: &str, body: &Value) -> Result<String> {
        let response = self
            .send_json("_local", Method::Put, &format!("_local/{local_id}"), body)
            .await?;
        response
            .get("rev")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ReplicationError::protocol("_local", "PUT response has no rev"))
    }

    /// One `_changes` request. Sent as a JSON POST when the peer accepts it,
    /// otherwise as a GET with query parameters.
    ///
    /// Long polls get the heartbeat added to the request timeout so an idle
    /// feed is not mistaken for a dead connection. They bypass the request
    /// pool.
    pub async fn changes(&self, query: &ChangesQuery) -> Result<ChangesPage> {
        let mut request = if self.supports_post_changes() {
            HttpRequest::new(Method::Post, self.build_relative_url("_changes")?)
                .with_json(&query.to_post_body())
        } else {
            HttpRequest::new(Method::Get, self.build_relative_url(&query.to_relative_url())?)
        };
        if query.mode == FeedMode::LongPoll {
            let heartbeat = query.heartbeat.unwrap_or_default();
            request.timeout = Some(self.request_timeout + heartbeat);
        }
        let pooled = query.mode != FeedMode::LongPoll;
        let response = self.send("_changes", request, None, pooled).await?;
        parse_changes(&response.body)
    }

    /// `POST _bulk_docs` with `new_edits: false`.
    pub async fn bulk_docs(&self, docs: Vec<Value>) -> Result<Vec<BulkDocsResult>> {
        let body = json!({"docs": docs, "new_edits": false});
        let response = self.send_json("_bulk_docs", Method::Post, "_bulk_docs", &body).await?;
        // new_edits=false servers may answer with an empty array.
        serde_json::from_value(response).map_err(|e| ReplicationError::protocol("_bulk_docs", e.to_string()))
    }

    /// `PUT <doc>?new_edits=false` with a JSON body.
    pub async fn put_document_json(&self, doc_id: &str, doc: &Value) -> Result<()> {
        let mut url = self.document_url(doc_id)?;
        url.set_query(Some("new_edits=false"));
        let request = HttpRequest::new(Method::Put, url).with_json(doc);
        self.request("PUT doc", request, Some(doc_id)).await?;
        Ok(())
    }

    /// `PUT <doc>?new_edits=false` as `multipart/related`, attachment bodies
    /// in separate parts.
    pub async fn put_document_multipart(
        &self,
        doc_id: &str,
        doc: &Value,
        parts: &[MultipartPart],
    ) -> Result<()> {
        let mut url = self.document_url(doc_id)?;
        url.set_query(Some("new_edits=false"));
        let boundary = multipart_boundary(doc);
        let (content_type, body) = encode_multipart_related(&boundary, doc, parts);
        let request = HttpRequest::new(Method::Put, url).with_body(&content_type, body);
        self.request("PUT doc", request, Some(doc_id)).await?;
        Ok(())
    }

    /// `GET <doc>?rev=X&revs=true&attachments=true[&atts_since=[...]]`.
    pub async fn get_revision(
        &self,
        doc_id: &str,
        rev: &RevisionId,
        atts_since: &[RevisionId],
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let mut url = self.document_url(doc_id)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("rev", &rev.to_string());
            query.append_pair("revs", "true");
            query.append_pair("attachments", "true");
            if !atts_since.is_empty() {
                let since: Vec<String> = atts_since.iter().map(ToString::to_string).collect();
                query.append_pair("atts_since", &Value::from(since).to_string());
            }
        }
        let mut request = HttpRequest::new(Method::Get, url);
        request.timeout = timeout;
        let response = self.request("GET doc", request, Some(doc_id)).await?;
        response.json_body("GET doc")
    }

    /// `POST _bulk_get?revs=true&attachments=true`.
    ///
    /// A 404/405/501 marks the endpoint unsupported for the rest of the
    /// session; callers then fall back to per-document GETs.
    pub async fn bulk_get(&self, requests: &[BulkGetRequest]) -> Result<Vec<BulkGetItem>> {
        let docs: Vec<Value> = requests
            .iter()
            .map(|r| {
                let mut entry = json!({"id": r.doc_id, "rev": r.rev.to_string()});
                if !r.atts_since.is_empty() {
                    entry["atts_since"] =
                        Value::from(r.atts_since.iter().map(ToString::to_string).collect::<Vec<_>>());
                }
                entry
            })
            .collect();
        let body = json!({ "docs": docs });

        let response = match self
            .send_json("_bulk_get", Method::Post, "_bulk_get?revs=true&attachments=true", &body)
            .await
        {
            Ok(response) => response,
            Err(e) if matches!(e.status(), Some(404 | 405 | 501)) => {
                debug!("Peer does not support _bulk_get");
                self.bulk_get_rejected.store(true, Ordering::Relaxed);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| ReplicationError::protocol("_bulk_get", "missing results"))?;
        let mut items = Vec::new();
        for result in results {
            let doc_id = result.get("id").and_then(Value::as_str).unwrap_or_default();
            for entry in result.get("docs").and_then(Value::as_array).into_iter().flatten() {
                if let Some(doc) = entry.get("ok") {
                    items.push(BulkGetItem::Found(doc.clone()));
                } else if let Some(error) = entry.get("error") {
                    items.push(BulkGetItem::Failed {
                        doc_id: error
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or(doc_id)
                            .to_string(),
                        rev: error.get("rev").and_then(Value::as_str).map(str::to_string),
                        error: error
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        reason: error
                            .get("reason")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
        }
        Ok(items)
    }
}

/// Boundary derived from the document so encodings are reproducible.
fn multipart_boundary(doc: &Value) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(doc.to_string().as_bytes());
    format!("repl-{:x}", digest)[..37].to_string()
}

/// Compare dotted version strings numerically (`0.93` vs `0.100`).
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split(|c: char| c == '.' || c.is_whitespace() || c == '(')
            .take_while(|p| !p.is_empty())
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, TransportFuture};
    use parking_lot::Mutex;

    /// Transport answering every request with a fixed response.
    struct Canned {
        response: Mutex<Option<HttpResponse>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Canned {
        fn new(response: Option<HttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(response),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl HttpTransport for Canned {
        fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
            self.seen.lock().push(request);
            let response = self.response.lock().clone();
            Box::pin(async move { response.ok_or_else(|| TransportError("connection refused".into())) })
        }
    }

    fn client(transport: Arc<Canned>) -> PeerClient {
        PeerClient::new(
            transport,
            Url::parse("http://localhost:4984/db").unwrap(),
            Arc::new(Bulkhead::new(2)),
        )
    }

    #[test]
    fn test_build_relative_url_leading_slash() {
        let peer = client(Canned::new(None));
        assert_eq!(peer.base_url().as_str(), "http://localhost:4984/db/");
        let a = peer.build_relative_url("_session").unwrap();
        let b = peer.build_relative_url("/_session").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "http://localhost:4984/db/_session");
        let q = peer.build_relative_url("_changes?since=1").unwrap();
        assert_eq!(q.query(), Some("since=1"));
    }

    #[test]
    fn test_document_url_encoding() {
        let peer = client(Canned::new(None));
        assert_eq!(
            peer.document_url("a b/c").unwrap().as_str(),
            "http://localhost:4984/db/a%20b%2Fc"
        );
        assert_eq!(
            peer.document_url("_design/app").unwrap().as_str(),
            "http://localhost:4984/db/_design/app"
        );
    }

    #[test]
    fn test_sync_gateway_version() {
        let peer = client(Canned::new(None));
        assert!(!peer.is_sync_gateway_version("0.01"));
        peer.set_server_header("Couchbase Sync Gateway/0.93");
        assert!(peer.is_sync_gateway_version("0.92"));
        assert!(peer.is_sync_gateway_version("0.93"));
        assert!(!peer.is_sync_gateway_version("0.94"));
        assert!(peer.supports_post_changes());
        assert!(peer.supports_bulk_get());

        peer.set_server_header("CouchDB/1.6.1 (Erlang OTP/R16B)");
        assert!(!peer.is_sync_gateway());
        assert!(!peer.supports_post_changes());
    }

    #[test]
    fn test_compare_versions() {
        use std::cmp::Ordering::*;
        assert_eq!(compare_versions("1.2", "1.10"), Less);
        assert_eq!(compare_versions("1.0", "1"), Equal);
        assert_eq!(compare_versions("2.1(7;abc)", "2.1"), Equal);
    }

    #[tokio::test]
    async fn test_request_decorates_headers_and_cookies() {
        let transport = Canned::new(Some(HttpResponse::json(200, &json!({}))));
        let mut headers = BTreeMap::new();
        headers.insert("X-Custom".to_string(), "yes".to_string());
        let peer = client(Arc::clone(&transport)).with_headers(headers);
        peer.set_cookie("SyncGatewaySession", "abc");
        peer.set_cookie("other", "1");
        peer.set_auth_header("Authorization", "Basic Zm9vOmJhcg==");

        peer.get_json("test", "_session").await.unwrap();

        let seen = transport.seen.lock();
        let req = &seen[0];
        assert_eq!(req.header("X-Custom"), Some("yes"));
        assert_eq!(req.header("Cookie"), Some("SyncGatewaySession=abc; other=1"));
        assert_eq!(req.header("Authorization"), Some("Basic Zm9vOmJhcg=="));
        assert_eq!(req.header("Accept"), Some("application/json"));
        assert!(req.timeout.is_some());
    }

    #[tokio::test]
    async fn test_delete_cookie() {
        let transport = Canned::new(Some(HttpResponse::json(200, &json!({}))));
        let peer = client(Arc::clone(&transport));
        peer.set_cookie("a", "1");
        peer.delete_cookie("a");
        peer.get_json("test", "x").await.unwrap();
        assert!(transport.seen.lock()[0].header("Cookie").is_none());
    }

    #[tokio::test]
    async fn test_response_cookies_and_server_captured() {
        let response = HttpResponse::json(200, &json!({"ok": true}))
            .with_header("Server", "Couchbase Sync Gateway/1.0")
            .with_header("Set-Cookie", "SyncGatewaySession=xyz; Path=/db; HttpOnly")
            .with_header("Set-Cookie", "gone=; Max-Age=0");
        let peer = client(Canned::new(Some(response)));
        peer.set_cookie("gone", "old");
        peer.get_json("test", "x").await.unwrap();
        assert_eq!(peer.cookie("SyncGatewaySession").as_deref(), Some("xyz"));
        assert!(peer.cookie("gone").is_none());
        assert!(peer.is_sync_gateway());
    }

    #[tokio::test]
    async fn test_bulk_docs_rows() {
        let rows = json!([{"id": "a", "rev": "1-x"}, {"id": "b", "error": "forbidden", "reason": "no", "status": 403}]);
        let peer = client(Canned::new(Some(HttpResponse::json(201, &rows))));
        let parsed = peer.bulk_docs(vec![json!({"_id": "a"}), json!({"_id": "b"})]).await.unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(!parsed[0].is_error());
        assert!(parsed[1].is_error());
        assert_eq!(parsed[1].status, Some(403));

        let peer = client(Canned::new(Some(HttpResponse::json(201, &json!([])))));
        assert!(peer.bulk_docs(vec![json!({"_id": "a"})]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_docs_unusable_body_is_protocol_error() {
        for body in [json!([{"error": "forbidden", "reason": "no"}]), json!({"ok": true})] {
            let peer = client(Canned::new(Some(HttpResponse::json(201, &body))));
            let err = peer.bulk_docs(vec![json!({"_id": "a"})]).await.unwrap_err();
            assert!(matches!(err, ReplicationError::Protocol { .. }), "{err}");
            assert!(!err.is_retryable());
        }
    }

    #[tokio::test]
    async fn test_status_classification() {
        for (status, retryable, fatal) in [(503, true, false), (401, false, true), (404, false, false)] {
            let peer = client(Canned::new(Some(HttpResponse::json(status, &json!({"reason": "nope"})))));
            let err = peer.get_json("test", "x").await.unwrap_err();
            assert_eq!(err.status(), Some(status));
            assert_eq!(err.is_retryable(), retryable);
            assert_eq!(err.is_session_fatal(), fatal);
        }
    }

    #[tokio::test]
    async fn test_rejection_carries_reason() {
        let peer = client(Canned::new(Some(HttpResponse::json(403, &json!({"reason": "x"})))));
        // 403 is authentication, 400 keeps the server's reason.
        assert!(peer.get_json("t", "x").await.unwrap_err().is_session_fatal());
        let peer = client(Canned::new(Some(HttpResponse::json(400, &json!({"reason": "bad doc"})))));
        let err = peer.put_document_json("d1", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("bad doc"));
        assert!(err.to_string().contains("d1"));
    }

    #[tokio::test]
    async fn test_network_error_is_transient() {
        let peer = client(Canned::new(None));
        let err = peer.get_json("test", "x").await.unwrap_err();
        assert!(matches!(err, ReplicationError::TransientNetwork { .. }));
    }

    #[tokio::test]
    async fn test_get_local_404_is_none() {
        let peer = client(Canned::new(Some(HttpResponse::json(404, &json!({"error": "not_found"})))));
        assert!(peer.get_local("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_revision_query() {
        let transport = Canned::new(Some(HttpResponse::json(200, &json!({"_id": "d", "_rev": "2-b"}))));
        let peer = client(Arc::clone(&transport));
        let rev: RevisionId = "2-b".parse().unwrap();
        let since: RevisionId = "1-a".parse().unwrap();
        peer.get_revision("d", &rev, &[since], None).await.unwrap();
        let seen = transport.seen.lock();
        let query = seen[0].url.query().unwrap().to_string();
        assert!(query.contains("rev=2-b"));
        assert!(query.contains("revs=true"));
        assert!(query.contains("attachments=true"));
        assert!(query.contains("atts_since=%5B%221-a%22%5D"));
    }

    #[tokio::test]
    async fn test_bulk_get_parses_results_and_marks_unsupported() {
        let body = json!({"results": [
            {"id": "a", "docs": [{"ok": {"_id": "a", "_rev": "1-x"}}]},
            {"id": "b", "docs": [{"error": {"id": "b", "rev": "1-y", "error": "not_found", "reason": "missing"}}]}
        ]});
        let peer = client(Canned::new(Some(HttpResponse::json(200, &body))));
        peer.set_server_header("Couchbase Sync Gateway/1.2");
        let items = peer
            .bulk_get(&[BulkGetRequest {
                doc_id: "a".into(),
                rev: "1-x".parse().unwrap(),
                atts_since: vec![],
            }])
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], BulkGetItem::Found(doc) if doc["_id"] == "a"));
        assert!(matches!(&items[1], BulkGetItem::Failed { doc_id, .. } if doc_id == "b"));

        let peer = client(Canned::new(Some(HttpResponse::json(404, &json!({})))));
        peer.set_server_header("Couchbase Sync Gateway/1.2");
        assert!(peer.bulk_get(&[]).await.is_err());
        assert!(!peer.supports_bulk_get());
    }

    #[tokio::test]
    async fn test_longpoll_bypasses_request_pool() {
        let body = json!({"results": [], "last_seq": 4});
        let transport = Canned::new(Some(HttpResponse::json(200, &body)));
        let pool = Arc::new(Bulkhead::new(1));
        let peer = PeerClient::new(transport, Url::parse("http://localhost:4984/db").unwrap(), Arc::clone(&pool));
        let _held = pool.acquire().await.unwrap();

        let mut query = ChangesQuery {
            mode: FeedMode::LongPoll,
            since: None,
            limit: 10,
            heartbeat: Some(Duration::from_secs(1)),
            filter: None,
            doc_ids: Vec::new(),
        };
        let page = tokio::time::timeout(Duration::from_secs(1), peer.changes(&query))
            .await
            .expect("long poll waited on the request pool")
            .unwrap();
        assert!(page.entries.is_empty());

        query.mode = FeedMode::Normal;
        query.heartbeat = None;
        let blocked = tokio::time::timeout(Duration::from_millis(50), peer.changes(&query)).await;
        assert!(blocked.is_err(), "catch-up pages share the pool");
    }

    #[tokio::test]
    async fn test_changes_uses_post_for_new_sync_gateway() {
        let body = json!({"results": [{"seq": 1, "id": "a", "changes": [{"rev": "1-x"}]}], "last_seq": 1});
        let transport = Canned::new(Some(HttpResponse::json(200, &body)));
        let peer = client(Arc::clone(&transport));
        let query = ChangesQuery {
            mode: FeedMode::LongPoll,
            since: None,
            limit: 10,
            heartbeat: Some(Duration::from_secs(1)),
            filter: None,
            doc_ids: Vec::new(),
        };

        let page = peer.changes(&query).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        peer.set_server_header("Couchbase Sync Gateway/1.0");
        peer.changes(&query).await.unwrap();

        let seen = transport.seen.lock();
        assert_eq!(seen[0].method, Method::Get);
        assert!(seen[0].url.query().unwrap().contains("feed=longpoll"));
        assert_eq!(seen[0].timeout, Some(Duration::from_secs(61)));
        assert_eq!(seen[1].method, Method::Post);
        assert_eq!(seen[1].url.path(), "/db/_changes");
        assert_eq!(seen[1].json_body().unwrap()["feed"], "longpoll");
    }

    #[tokio::test]
    async fn test_multipart_put_content_type() {
        let transport = Canned::new(Some(HttpResponse::json(201, &json!({"ok": true}))));
        let peer = client(Arc::clone(&transport));
        let parts = [MultipartPart {
            filename: Some("f".into()),
            content_type: "text/plain".into(),
            data: b"x".to_vec(),
        }];
        peer.put_document_multipart("d", &json!({"_id": "d"}), &parts).await.unwrap();
        let seen = transport.seen.lock();
        assert!(seen[0]
            .header("Content-Type")
            .unwrap()
            .starts_with("multipart/related; boundary="));
        assert_eq!(seen[0].url.query(), Some("new_edits=false"));
    }
}
