//! In-memory Sync Gateway stand-in.
//!
//! Implements [`HttpTransport`] over a [`MemoryStore`] that plays the remote
//! database. Every request is recorded for assertions, and faults can be
//! scripted per endpoint (status codes or dropped connections).
//!
//! # Example
//! ```rust,ignore
//! let peer = MockPeer::new();
//! peer.fail_next(Some(Method::Post), "_bulk_docs", Fault::Status(503), 1);
//!
//! let replication = ReplicationBuilder::new(config, local)
//!     .transport(peer.clone())
//!     .build()?;
//!
//! assert_eq!(peer.requests_to(Method::Post, "_bulk_docs").len(), 2);
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use doc_replicator::checkpoint::CheckpointId;
use doc_replicator::revision::{RevisionHistory, RevisionId};
use doc_replicator::store::{IncomingRevision, InsertOutcome, LocalStore, MemoryStore};
use doc_replicator::transport::{
    decode_multipart_related, HttpRequest, HttpResponse, HttpTransport, Method, TransportError,
    TransportFuture,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Base URL the mock answers for.
pub const MOCK_URL: &str = "http://sync.test/db";

/// Server header announced by [`MockPeer::sync_gateway`].
pub const SYNC_GATEWAY_SERVER: &str = "Couchbase Sync Gateway/1.2";

const SESSION_COOKIE: &str = "SyncGatewaySession";
const SESSION_TOKEN: &str = "mock-session";

/// A recorded request, path relative to the database.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub content_type: Option<String>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Number of documents in a `_bulk_docs` body.
    pub fn bulk_doc_count(&self) -> usize {
        self.body
            .as_ref()
            .and_then(|b| b.get("docs"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }
}

/// A scripted failure.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Status(u16),
    Network,
    /// Answer with this status and raw JSON body instead of handling it.
    Reply(u16, &'static str),
}

struct ScriptedFault {
    method: Option<Method>,
    path_prefix: String,
    fault: Fault,
    remaining: usize,
}

#[derive(Default)]
struct PeerState {
    requests: Vec<RecordedRequest>,
    /// `_local` documents: id -> (revision counter, body).
    local_docs: HashMap<String, (u64, Value)>,
    faults: Vec<ScriptedFault>,
    server: Option<String>,
    bulk_get: bool,
    reject_multipart: bool,
    offline: bool,
    credentials: Option<(String, String)>,
    access_token: Option<String>,
}

/// Mock remote database.
pub struct MockPeer {
    /// The remote database contents.
    pub store: Arc<MemoryStore>,
    state: Mutex<PeerState>,
}

impl MockPeer {
    /// A CouchDB-like peer (no `Server` header, no `_bulk_get`).
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(MemoryStore::new("remote-db")),
            state: Mutex::new(PeerState::default()),
        })
    }

    /// A Sync Gateway peer: POST `_changes` and `_bulk_get` available.
    pub fn sync_gateway() -> Arc<Self> {
        let peer = Self::new();
        {
            let mut state = peer.state.lock();
            state.server = Some(SYNC_GATEWAY_SERVER.to_string());
            state.bulk_get = true;
        }
        peer
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Fail the next `times` requests whose path starts with `path_prefix`.
    pub fn fail_next(&self, method: Option<Method>, path_prefix: &str, fault: Fault, times: usize) {
        self.state.lock().faults.push(ScriptedFault {
            method,
            path_prefix: path_prefix.to_string(),
            fault,
            remaining: times,
        });
    }

    /// Answer `_bulk_get` with 404 while still announcing Sync Gateway.
    pub fn without_bulk_get(&self) {
        self.state.lock().bulk_get = false;
    }

    /// Drop every connection while set.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Answer multipart uploads with 415.
    pub fn reject_multipart(&self) {
        self.state.lock().reject_multipart = true;
    }

    /// Require Basic credentials or a session cookie on every request.
    pub fn require_login(&self, username: &str, password: &str) {
        self.state.lock().credentials = Some((username.to_string(), password.to_string()));
    }

    /// Accept `POST _facebook` with this token.
    pub fn accept_token(&self, token: &str) {
        self.state.lock().access_token = Some(token.to_string());
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests with this method whose path starts with `path_prefix`.
    pub fn requests_to(&self, method: Method, path_prefix: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path.starts_with(path_prefix))
            .cloned()
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// `lastSequence` of a checkpoint document.
    pub fn checkpoint(&self, id: &CheckpointId) -> Option<String> {
        let state = self.state.lock();
        let (_, doc) = state.local_docs.get(id.as_str())?;
        match doc.get("lastSequence")? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Write a checkpoint document as another client would.
    pub fn set_checkpoint(&self, id: &CheckpointId, sequence: &str) {
        let mut state = self.state.lock();
        let entry = state
            .local_docs
            .entry(id.as_str().to_string())
            .or_insert((0, Value::Null));
        entry.0 += 1;
        entry.1 = json!({"_id": id.local_doc_id(), "lastSequence": sequence});
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn take_fault(&self, method: Method, path: &str) -> Option<Fault> {
        let mut state = self.state.lock();
        if state.offline {
            return Some(Fault::Network);
        }
        let scripted = state.faults.iter_mut().find(|f| {
            f.remaining > 0
                && f.method.map_or(true, |m| m == method)
                && path.starts_with(&f.path_prefix)
        })?;
        scripted.remaining -= 1;
        Some(scripted.fault)
    }

    fn authorized(&self, request: &HttpRequest) -> bool {
        let state = self.state.lock();
        let Some((user, password)) = &state.credentials else {
            return true;
        };
        let basic = format!("Basic {}", STANDARD.encode(format!("{user}:{password}")));
        if request.header("Authorization") == Some(basic.as_str()) {
            return true;
        }
        has_session_cookie(request)
    }

    async fn dispatch(&self, request: HttpRequest, path: String) -> HttpResponse {
        let method = request.method;
        let is_login = path == "_session" || (method == Method::Post && path == "_facebook");
        if !is_login && !self.authorized(&request) {
            return HttpResponse::json(401, &json!({"error": "Unauthorized"}));
        }

        match (method, path.as_str()) {
            (Method::Get, "_session") => self.session_info(&request),
            (Method::Post, "_session") => self.session_login(&request),
            (Method::Post, "_facebook") => self.token_login(&request),
            (Method::Get | Method::Post, "_changes") => self.changes(&request).await,
            (Method::Post, "_revs_diff") => self.revs_diff(&request).await,
            (Method::Post, "_bulk_docs") => self.bulk_docs(&request).await,
            (Method::Post, "_bulk_get") => self.bulk_get(&request).await,
            (_, p) if p.starts_with("_local/") => self.local_doc(&request, &p["_local/".len()..]),
            (Method::Get, doc_id) => self.get_doc(&request, doc_id).await,
            (Method::Put, doc_id) => self.put_doc(&request, doc_id).await,
            _ => not_found(),
        }
    }

    // =========================================================================
    // Authentication endpoints
    // =========================================================================

    fn session_info(&self, request: &HttpRequest) -> HttpResponse {
        let name = if has_session_cookie(request) {
            self.state
                .lock()
                .credentials
                .as_ref()
                .map_or(json!("token-user"), |(user, _)| json!(user))
        } else {
            Value::Null
        };
        HttpResponse::json(200, &json!({"ok": true, "userCtx": {"name": name}}))
    }

    fn session_login(&self, request: &HttpRequest) -> HttpResponse {
        let body = request.json_body().unwrap_or(Value::Null);
        let accepted = self.state.lock().credentials.as_ref().is_some_and(|(user, password)| {
            body["name"].as_str() == Some(user.as_str()) && body["password"].as_str() == Some(password.as_str())
        });
        if accepted {
            session_response()
        } else {
            HttpResponse::json(401, &json!({"error": "Unauthorized"}))
        }
    }

    fn token_login(&self, request: &HttpRequest) -> HttpResponse {
        let body = request.json_body().unwrap_or(Value::Null);
        let accepted = self
            .state
            .lock()
            .access_token
            .as_deref()
            .is_some_and(|token| body["access_token"].as_str() == Some(token));
        if accepted {
            session_response()
        } else {
            HttpResponse::json(401, &json!({"error": "Unauthorized"}))
        }
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    fn local_doc(&self, request: &HttpRequest, id: &str) -> HttpResponse {
        let mut state = self.state.lock();
        match request.method {
            Method::Get => match state.local_docs.get(id) {
                Some((rev, doc)) => {
                    let mut doc = doc.clone();
                    doc["_rev"] = json!(format!("0-{rev}"));
                    HttpResponse::json(200, &doc)
                }
                None => not_found(),
            },
            Method::Put => {
                let Some(mut body) = request.json_body() else {
                    return HttpResponse::json(400, &json!({"error": "bad_request"}));
                };
                let sent_rev = body.get("_rev").and_then(Value::as_str).map(str::to_string);
                let current = state.local_docs.get(id).map(|(rev, _)| format!("0-{rev}"));
                if sent_rev != current {
                    return HttpResponse::json(409, &json!({"error": "conflict"}));
                }
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("_rev");
                }
                let entry = state.local_docs.entry(id.to_string()).or_insert((0, Value::Null));
                entry.0 += 1;
                entry.1 = body;
                let rev = format!("0-{}", entry.0);
                HttpResponse::json(201, &json!({"ok": true, "id": format!("_local/{id}"), "rev": rev}))
            }
            _ => not_found(),
        }
    }

    // =========================================================================
    // Change feed
    // =========================================================================

    async fn changes(&self, request: &HttpRequest) -> HttpResponse {
        let params = changes_params(request);
        let since = params
            .get("since")
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .unwrap_or(0);
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .map_or(usize::MAX, |l| l as usize);
        let longpoll = params.get("feed").and_then(Value::as_str) == Some("longpoll");
        let heartbeat = params
            .get("heartbeat")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .map_or(Duration::from_millis(200), Duration::from_millis)
            .min(Duration::from_secs(1));
        let doc_ids: Option<BTreeSet<String>> = match params.get("doc_ids") {
            Some(Value::Array(ids)) => Some(ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
            Some(Value::String(raw)) => serde_json::from_str(raw).ok(),
            _ => None,
        };

        let mut page = self.change_page(since, limit, doc_ids.as_ref()).await;
        if longpoll && page["results"].as_array().is_some_and(Vec::is_empty) {
            let mut sequence = self.store.watch_sequence();
            let _ = tokio::time::timeout(heartbeat, sequence.wait_for(|s| *s > since)).await;
            page = self.change_page(since, limit, doc_ids.as_ref()).await;
        }
        HttpResponse::json(200, &page)
    }

    async fn change_page(&self, since: u64, limit: usize, doc_ids: Option<&BTreeSet<String>>) -> Value {
        let mut results = Vec::new();
        let mut last_seq = since;
        for change in self.store.changes_since(since, usize::MAX).await.unwrap_or_default() {
            if results.len() >= limit {
                break;
            }
            last_seq = change.sequence;
            if doc_ids.is_some_and(|ids| !ids.contains(&change.doc_id)) {
                continue;
            }
            let leaves = self.store.current_leaves(&change.doc_id).await.unwrap_or_default();
            if leaves.is_empty() {
                continue;
            }
            let deleted = self
                .store
                .get_document(&change.doc_id)
                .await
                .ok()
                .flatten()
                .is_some_and(|winner| winner.deleted);
            let changes: Vec<Value> = leaves.iter().map(|r| json!({"rev": r.to_string()})).collect();
            let mut entry = json!({"seq": change.sequence, "id": change.doc_id, "changes": changes});
            if deleted {
                entry["deleted"] = json!(true);
            }
            results.push(entry);
        }
        json!({"results": results, "last_seq": last_seq})
    }

    // =========================================================================
    // Push endpoints
    // =========================================================================

    async fn revs_diff(&self, request: &HttpRequest) -> HttpResponse {
        let Some(Value::Object(body)) = request.json_body() else {
            return HttpResponse::json(400, &json!({"error": "bad_request"}));
        };
        let mut response = Map::new();
        for (doc_id, revs) in body {
            let revs: Vec<RevisionId> = revs
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|r| r.as_str()?.parse().ok())
                .collect();
            let missing = self.store.missing_revisions(&doc_id, &revs).await.unwrap_or_default();
            if missing.is_empty() {
                continue;
            }
            let mut ancestors = BTreeSet::new();
            for rev in &missing {
                ancestors.extend(self.store.possible_ancestors(&doc_id, rev).await.unwrap_or_default());
            }
            let mut entry = json!({"missing": missing.iter().map(ToString::to_string).collect::<Vec<_>>()});
            if !ancestors.is_empty() {
                entry["possible_ancestors"] = json!(ancestors.iter().map(ToString::to_string).collect::<Vec<_>>());
            }
            response.insert(doc_id, entry);
        }
        HttpResponse::json(200, &Value::Object(response))
    }

    async fn bulk_docs(&self, request: &HttpRequest) -> HttpResponse {
        let docs = request
            .json_body()
            .and_then(|b| b.get("docs").cloned())
            .and_then(|d| d.as_array().cloned())
            .unwrap_or_default();
        let mut rows = Vec::new();
        for doc in docs {
            let doc_id = doc["_id"].as_str().unwrap_or_default().to_string();
            rows.push(match self.apply(&doc_id, doc).await {
                Ok(rev) => json!({"id": doc_id, "rev": rev}),
                Err((status, reason)) => json!({
                    "id": doc_id,
                    "error": if status == 403 { "forbidden" } else { "bad_request" },
                    "reason": reason,
                    "status": status,
                }),
            });
        }
        HttpResponse::json(201, &Value::Array(rows))
    }

    async fn put_doc(&self, request: &HttpRequest, doc_id: &str) -> HttpResponse {
        let content_type = request.header("Content-Type").unwrap_or_default().to_string();
        let body = request.body.clone().unwrap_or_default();
        let doc = if content_type.starts_with("multipart/related") {
            if self.state.lock().reject_multipart {
                return HttpResponse::json(415, &json!({"error": "unsupported_media_type"}));
            }
            let Some((mut doc, parts)) = decode_multipart_related(&content_type, &body) else {
                return HttpResponse::json(400, &json!({"error": "bad_request"}));
            };
            if let Some(attachments) = doc.get_mut("_attachments").and_then(Value::as_object_mut) {
                let mut unnamed = parts.iter().filter(|p| p.filename.is_none());
                for (name, meta) in attachments.iter_mut() {
                    if meta.get("follows").and_then(Value::as_bool) != Some(true) {
                        continue;
                    }
                    let part = parts
                        .iter()
                        .find(|p| p.filename.as_deref() == Some(name.as_str()))
                        .or_else(|| unnamed.next());
                    if let (Some(part), Some(meta)) = (part, meta.as_object_mut()) {
                        meta.remove("follows");
                        meta.insert("data".into(), json!(STANDARD.encode(&part.data)));
                    }
                }
            }
            doc
        } else {
            match serde_json::from_slice(&body) {
                Ok(doc) => doc,
                Err(_) => return HttpResponse::json(400, &json!({"error": "bad_request"})),
            }
        };

        match self.apply(doc_id, doc).await {
            Ok(rev) => HttpResponse::json(201, &json!({"ok": true, "id": doc_id, "rev": rev})),
            Err((status, reason)) => HttpResponse::json(status, &json!({"error": "rejected", "reason": reason})),
        }
    }

    async fn apply(&self, doc_id: &str, doc: Value) -> Result<String, (u16, String)> {
        let incoming = IncomingRevision::from_document(doc_id, doc).map_err(|e| (400, e.to_string()))?;
        let rev = incoming.rev_id.to_string();
        match self.store.insert_revision(doc_id, incoming).await {
            Ok(InsertOutcome::Applied | InsertOutcome::AlreadyPresent) => Ok(rev),
            Ok(InsertOutcome::Rejected(reason)) => Err((403, reason)),
            Err(e) => Err((500, e.to_string())),
        }
    }

    // =========================================================================
    // Pull endpoints
    // =========================================================================

    async fn document(&self, doc_id: &str, rev: Option<&str>) -> Option<Value> {
        let stored = match rev {
            Some(rev) => {
                let rev: RevisionId = rev.parse().ok()?;
                self.store.get_revision(doc_id, &rev).await.ok().flatten()?
            }
            None => self.store.get_document(doc_id).await.ok().flatten()?,
        };
        let history = RevisionHistory::from_ancestry(&stored.history);
        Some(stored.to_document(&history, &stored.attachments))
    }

    async fn get_doc(&self, request: &HttpRequest, doc_id: &str) -> HttpResponse {
        let rev = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "rev")
            .map(|(_, v)| v.into_owned());
        match self.document(doc_id, rev.as_deref()).await {
            Some(doc) => HttpResponse::json(200, &doc),
            None => not_found(),
        }
    }

    async fn bulk_get(&self, request: &HttpRequest) -> HttpResponse {
        if !self.state.lock().bulk_get {
            return not_found();
        }
        let requested = request
            .json_body()
            .and_then(|b| b.get("docs").cloned())
            .and_then(|d| d.as_array().cloned())
            .unwrap_or_default();
        let mut results = Vec::new();
        for entry in requested {
            let doc_id = entry["id"].as_str().unwrap_or_default().to_string();
            let rev = entry["rev"].as_str().map(str::to_string);
            let docs = match self.document(&doc_id, rev.as_deref()).await {
                Some(doc) => json!([{"ok": doc}]),
                None => json!([{"error": {
                    "id": doc_id,
                    "rev": rev,
                    "error": "not_found",
                    "reason": "missing",
                }}]),
            };
            results.push(json!({"id": doc_id, "docs": docs}));
        }
        HttpResponse::json(200, &json!({"results": results}))
    }
}

impl HttpTransport for MockPeer {
    fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
        Box::pin(async move {
            let path = request
                .url
                .path()
                .strip_prefix("/db/")
                .unwrap_or_default()
                .to_string();
            self.state.lock().requests.push(RecordedRequest {
                method: request.method,
                path: path.clone(),
                query: request.url.query_pairs().into_owned().collect(),
                headers: request.headers.clone(),
                body: request.json_body(),
                content_type: request.header("Content-Type").map(str::to_string),
            });

            let response = match self.take_fault(request.method, &path) {
                Some(Fault::Network) => return Err(TransportError("connection reset".to_string())),
                Some(Fault::Status(status)) => HttpResponse::json(status, &json!({"error": "scripted"})),
                Some(Fault::Reply(status, body)) => HttpResponse::new(status, body.as_bytes().to_vec())
                    .with_header("Content-Type", "application/json"),
                None => self.dispatch(request, path).await,
            };

            let server = self.state.lock().server.clone();
            Ok(match server {
                Some(server) => response.with_header("Server", server),
                None => response,
            })
        })
    }
}

fn not_found() -> HttpResponse {
    HttpResponse::json(404, &json!({"error": "not_found", "reason": "missing"}))
}

fn session_response() -> HttpResponse {
    HttpResponse::json(200, &json!({"ok": true}))
        .with_header("Set-Cookie", format!("{SESSION_COOKIE}={SESSION_TOKEN}; Path=/db; HttpOnly"))
}

fn has_session_cookie(request: &HttpRequest) -> bool {
    request
        .header("Cookie")
        .is_some_and(|c| c.split(';').any(|kv| kv.trim() == format!("{SESSION_COOKIE}={SESSION_TOKEN}")))
}

/// `_changes` parameters from the query string (GET) or JSON body (POST).
fn changes_params(request: &HttpRequest) -> Map<String, Value> {
    if request.method == Method::Post {
        if let Some(Value::Object(body)) = request.json_body() {
            return body;
        }
    }
    request
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect()
}
